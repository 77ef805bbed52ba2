//! The execution engine: frames, instruction dispatch, exception machinery,
//! statics, and the host-bridge intrinsics.

use std::sync::Arc;

use crate::error::{ExecutionError, VmError};
use crate::metadata::{Instruction, LocalVariable, MethodSignature, ParameterType};
use crate::types::generics::{ConcreteType, GenericLookup};
use crate::types::MethodDescription;
use crate::vm::state::SharedState;

#[macro_use]
pub mod macros;
pub mod exceptions;
pub mod executor;
pub mod instructions;
pub(crate) mod intrinsics;
pub mod stack;
pub mod state;
pub mod statics;

pub use executor::Interpreter;
pub use stack::{BasePointer, CallStack, StackFrame};

/// Everything frame setup and dispatch need to know about one method bound
/// to a generic scope: resolved local/parameter/return types and the parsed
/// protected regions.
#[derive(Clone)]
pub struct MethodInfo {
    pub source: MethodDescription,
    pub signature: &'static MethodSignature,
    pub locals: &'static [LocalVariable],
    pub instructions: &'static [Instruction],
    pub exceptions: Arc<Vec<exceptions::ProtectedSection>>,
    pub local_types: Vec<ConcreteType>,
    pub param_types: Vec<ConcreteType>,
    pub return_type: Option<ConcreteType>,
    pub is_cctor: bool,
}

impl MethodInfo {
    pub fn new(
        method: MethodDescription,
        generics: &GenericLookup,
        shared: &SharedState,
    ) -> Result<Self, VmError> {
        let body = method.method.body.as_ref().ok_or_else(|| {
            VmError::Execution(ExecutionError::NotImplemented(format!(
                "no body in executing method {:?}",
                method
            )))
        })?;

        let image = method.image();
        let world = &shared.assemblies;

        let local_types = body
            .header
            .local_variables
            .iter()
            .map(|l| world.make_concrete(image, generics, &l.var_type))
            .collect::<Result<Vec<_>, _>>()?;
        let param_types = method
            .method
            .signature
            .parameters
            .iter()
            .map(|p| {
                let inner = world.make_concrete(image, generics, p.inner())?;
                Ok(match p {
                    ParameterType::Ref(_) => world.intern(ConcreteType::new(
                        image,
                        crate::metadata::BaseType::ByRef(inner),
                    )),
                    ParameterType::Value(_) => inner,
                })
            })
            .collect::<Result<Vec<_>, VmError>>()?;
        let return_type = match &method.method.signature.return_type {
            Some(r) => Some(world.make_concrete(image, generics, r.inner())?),
            None => None,
        };

        Ok(Self {
            is_cctor: method.method.runtime_special_name
                && method.method.name == ".cctor"
                && !method.method.signature.instance
                && method.method.signature.parameters.is_empty(),
            signature: &method.method.signature,
            locals: &body.header.local_variables,
            instructions: &body.instructions,
            exceptions: Arc::new(exceptions::parse(&body.exceptions, image, generics, world)?),
            local_types,
            param_types,
            return_type,
            source: method,
        })
    }
}

/// Per-frame mutable execution state.
#[derive(Clone)]
pub struct MethodState {
    pub ip: usize,
    pub info_handle: MethodInfo,
}

impl MethodState {
    pub fn new(info_handle: MethodInfo) -> Self {
        Self { ip: 0, info_handle }
    }
}

#[derive(Clone, Debug)]
pub enum StepResult {
    InstructionStepped,
    MethodReturned,
    MethodThrew,
    Error(VmError),
}
