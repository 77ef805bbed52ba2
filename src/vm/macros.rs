//! Dispatch-loop plumbing shared by the instruction handlers and the
//! intrinsic implementations. All of these expand inside functions that
//! return [`crate::vm::StepResult`].

/// Pop the evaluation stack, surfacing underflow as a fatal error.
#[macro_export]
macro_rules! vm_pop {
    ($stack:expr) => {
        match $stack.pop_stack() {
            Ok(v) => v,
            Err(e) => return $crate::vm::StepResult::Error(e),
        }
    };
}

#[macro_export]
macro_rules! vm_push {
    ($stack:expr, $variant:ident ( $($args:expr),* )) => {
        $stack.push_stack($crate::value::StackValue::$variant($($args),*))
    };
    ($stack:expr, $val:expr) => {
        $stack.push_stack($val)
    };
}

/// Destructure a stack value, failing fatally on a shape the instruction
/// does not accept.
#[macro_export]
macro_rules! vm_expect_stack {
    (let $variant:ident ( $inner:pat ) = $v:expr) => {
        let $crate::value::StackValue::$variant($inner) = $v else {
            return $crate::vm::StepResult::Error($crate::error::VmError::Execution(
                $crate::error::ExecutionError::TypeMismatch {
                    expected: stringify!($variant),
                    found: "other stack value".to_string(),
                },
            ));
        };
    };
}

/// Unwrap a `Result` whose error converts into [`crate::error::VmError`].
#[macro_export]
macro_rules! res_try {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => {
                return $crate::vm::StepResult::Error($crate::error::VmError::from(e));
            }
        }
    };
}

/// Unwrap an operation result, routing managed failures into the exception
/// machinery and engine failures into a fatal error.
#[macro_export]
macro_rules! op_try {
    ($stack:expr, $e:expr) => {
        match $e {
            Ok(v) => v,
            Err($crate::value::OpError::Throw(name)) => return $stack.throw_by_name(name),
            Err($crate::value::OpError::Fatal(e)) => return $crate::vm::StepResult::Error(e),
        }
    };
}
