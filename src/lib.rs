//! An embeddable interpreter for ECMA-335 CIL bytecode.
//!
//! The crate consumes a parsed assembly image — type definitions, members,
//! and method bodies whose branch targets are instruction indices — and
//! executes managed code one instruction at a time against an evaluation
//! stack, with no JIT. Types load lazily through the resolver, interpreted
//! objects mirror runtime semantics (boxing, arrays, delegates, virtual
//! dispatch), and the exception machinery implements the two-pass
//! search/unwind model.
//!
//! ```no_run
//! use cilvm::metadata::*;
//! use cilvm::value::StackValue;
//! use cilvm::Interpreter;
//!
//! let mut image = Image::new("demo");
//! let ty = image.push_type_definition(TypeDef::new(None, "Program"));
//! let answer = image.push_method(
//!     ty,
//!     MethodDef::new(
//!         "Answer",
//!         MethodSignature::static_method(
//!             vec![],
//!             Some(ParameterType::Value(BaseType::Int32.into())),
//!         ),
//!         Some(MethodBody::with_instructions(vec![
//!             Instruction::LoadConstantInt32(42),
//!             Instruction::Return,
//!         ])),
//!     ),
//! );
//!
//! let mut interpreter = Interpreter::new();
//! let image = interpreter.assemblies().register(image);
//! let method = cilvm::types::MethodDescription {
//!     parent: cilvm::types::TypeDescription::new(image, ty),
//!     method: &image.definition()[answer],
//! };
//! assert!(matches!(
//!     interpreter.call(method, vec![]),
//!     Ok(StackValue::Int32(42))
//! ));
//! ```

pub mod corlib;
pub mod error;
pub mod metadata;
pub mod resolve;
pub mod types;
pub mod value;
#[macro_use]
pub mod vm;

pub use error::{CallError, ExecutionError, ResolutionError, VmError};
pub use vm::Interpreter;
