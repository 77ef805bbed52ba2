//! Shared harness: build synthetic images through the metadata construction
//! API and drive them through the public interpreter surface.

#![allow(dead_code)]

use cilvm::corlib::CORLIB_NAME;
use cilvm::metadata::*;
use cilvm::types::{ImageS, MethodDescription, TypeDescription};
use cilvm::value::StackValue;
use cilvm::Interpreter;

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn object_base() -> TypeSource<MethodType> {
    UserType::reference(CORLIB_NAME, "System.Object").into()
}

pub fn valuetype_base() -> TypeSource<MethodType> {
    UserType::reference(CORLIB_NAME, "System.ValueType").into()
}

pub fn corlib_class(full_name: &str) -> MethodType {
    MethodType::class(UserType::reference(CORLIB_NAME, full_name))
}

pub fn int() -> MethodType {
    BaseType::Int32.into()
}

pub fn long() -> MethodType {
    BaseType::Int64.into()
}

pub fn float64() -> MethodType {
    BaseType::Float64.into()
}

pub fn boolean() -> MethodType {
    BaseType::Boolean.into()
}

pub fn object() -> MethodType {
    BaseType::Object.into()
}

pub fn string() -> MethodType {
    BaseType::String.into()
}

pub fn val(t: MethodType) -> ParameterType {
    ParameterType::Value(t)
}

pub fn static_sig(params: Vec<MethodType>, ret: Option<MethodType>) -> MethodSignature {
    MethodSignature::static_method(params.into_iter().map(val).collect(), ret.map(val))
}

pub fn instance_sig(params: Vec<MethodType>, ret: Option<MethodType>) -> MethodSignature {
    MethodSignature::instance_method(params.into_iter().map(val).collect(), ret.map(val))
}

pub fn body(instructions: Vec<Instruction>) -> MethodBody {
    MethodBody::with_instructions(instructions)
}

pub fn body_with_locals(locals: Vec<MethodType>, instructions: Vec<Instruction>) -> MethodBody {
    MethodBody {
        header: Header {
            maximum_stack_size: 16,
            local_variables: locals.into_iter().map(LocalVariable::new).collect(),
            initialize_locals: true,
        },
        instructions,
        exceptions: vec![],
    }
}

/// Reference a constructor on a core-library type by parameter list.
pub fn corlib_ctor(full_name: &str, params: Vec<MethodType>) -> UserMethod {
    UserMethod::Reference(Box::new(MethodRef {
        parent: corlib_class(full_name),
        name: ".ctor".to_string(),
        signature: instance_sig(params, None),
    }))
}

/// Reference a method on a core-library type.
pub fn corlib_method(
    full_name: &str,
    name: &str,
    signature: MethodSignature,
) -> UserMethod {
    UserMethod::Reference(Box::new(MethodRef {
        parent: corlib_class(full_name),
        name: name.to_string(),
        signature,
    }))
}

pub struct Harness {
    pub interpreter: Interpreter,
    pub image: ImageS,
}

impl Harness {
    pub fn new(image: Image) -> Self {
        init_tracing();
        let mut interpreter = Interpreter::new();
        interpreter.set_instruction_budget(Some(1_000_000));
        let image = interpreter.assemblies().register(image);
        Self { interpreter, image }
    }

    pub fn method(&self, index: MethodIndex) -> MethodDescription {
        MethodDescription {
            parent: TypeDescription::new(self.image, index.parent_type()),
            method: &self.image.definition()[index],
        }
    }

    pub fn type_of(&self, index: TypeIndex) -> TypeDescription {
        TypeDescription::new(self.image, index)
    }

    pub fn call(
        &mut self,
        index: MethodIndex,
        args: Vec<StackValue>,
    ) -> Result<StackValue, cilvm::CallError> {
        let method = self.method(index);
        self.interpreter.call(method, args)
    }

    pub fn call_int(&mut self, index: MethodIndex, args: Vec<StackValue>) -> i32 {
        match self.call(index, args) {
            Ok(StackValue::Int32(i)) => i,
            other => panic!("expected int32 result, got {:?}", other),
        }
    }

    pub fn expect_unhandled(
        &mut self,
        index: MethodIndex,
        args: Vec<StackValue>,
    ) -> String {
        match self.call(index, args) {
            Err(cilvm::CallError::Unhandled { type_name, .. }) => type_name,
            other => panic!("expected an unhandled exception, got {:?}", other.map(|v| format!("{:?}", v))),
        }
    }
}
