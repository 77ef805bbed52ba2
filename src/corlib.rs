//! The synthesized core library.
//!
//! The host runtime contributes primitive types, the root object hierarchy,
//! and the exception types the engine raises. They are built here as a
//! regular image so interpreted code can reference, extend, catch, and
//! reflect on them like any other types. Methods the engine implements
//! natively are marked `internal_call` and dispatch through the intrinsic
//! table; the exception helpers carry ordinary CIL bodies.

use crate::metadata::*;

pub const CORLIB_NAME: &str = "System.Private.CoreLib";

fn string_type() -> MethodType {
    BaseType::String.into()
}

fn object_type() -> MethodType {
    BaseType::Object.into()
}

fn int_type() -> MethodType {
    BaseType::Int32.into()
}

fn value(t: MethodType) -> ParameterType {
    ParameterType::Value(t)
}

pub fn build() -> Image {
    let mut image = Image::new(CORLIB_NAME);

    // System.Object
    let object = image.push_type_definition(TypeDef::new(Some("System"), "Object"));
    image.push_method(
        object,
        MethodDef::constructor(
            MethodSignature::instance_method(vec![], None),
            MethodBody::with_instructions(vec![Instruction::Return]),
        ),
    );
    image.push_method(
        object,
        MethodDef::internal(
            "GetType",
            MethodSignature::instance_method(
                vec![],
                Some(value(MethodType::class(UserType::reference(
                    CORLIB_NAME,
                    "System.Type",
                )))),
            ),
        ),
    );
    image.push_method(object, {
        let mut m = MethodDef::internal(
            "Equals",
            MethodSignature::instance_method(
                vec![value(object_type())],
                Some(value(BaseType::Boolean.into())),
            ),
        );
        m.virtual_member = true;
        m
    });
    image.push_method(object, {
        let mut m = MethodDef::internal(
            "GetHashCode",
            MethodSignature::instance_method(vec![], Some(value(int_type()))),
        );
        m.virtual_member = true;
        m
    });
    image.push_method(object, {
        let mut m = MethodDef::internal(
            "ToString",
            MethodSignature::instance_method(vec![], Some(value(string_type()))),
        );
        m.virtual_member = true;
        m
    });
    image.push_method(
        object,
        MethodDef::internal(
            "ReferenceEquals",
            MethodSignature::static_method(
                vec![value(object_type()), value(object_type())],
                Some(value(BaseType::Boolean.into())),
            ),
        ),
    );

    // System.ValueType, System.Enum
    let value_type = {
        let mut t = TypeDef::new(Some("System"), "ValueType");
        t.extends = Some(object.into());
        t.flags.abstract_type = true;
        image.push_type_definition(t)
    };
    {
        let mut t = TypeDef::new(Some("System"), "Enum");
        t.extends = Some(value_type.into());
        t.flags.abstract_type = true;
        image.push_type_definition(t);
    }

    // System.String
    let string = {
        let mut t = TypeDef::new(Some("System"), "String");
        t.extends = Some(object.into());
        t.flags.sealed = true;
        image.push_type_definition(t)
    };
    image.push_method(string, {
        let mut m = MethodDef::internal(
            "get_Length",
            MethodSignature::instance_method(vec![], Some(value(int_type()))),
        );
        m.special_name = true;
        m
    });
    image.push_method(
        string,
        MethodDef::internal(
            "Concat",
            MethodSignature::static_method(
                vec![value(string_type()), value(string_type())],
                Some(value(string_type())),
            ),
        ),
    );
    image.push_method(string, {
        let mut m = MethodDef::internal(
            "op_Equality",
            MethodSignature::static_method(
                vec![value(string_type()), value(string_type())],
                Some(value(BaseType::Boolean.into())),
            ),
        );
        m.special_name = true;
        m
    });
    image.push_method(string, {
        let mut m = MethodDef::internal(
            "Equals",
            MethodSignature::instance_method(
                vec![value(object_type())],
                Some(value(BaseType::Boolean.into())),
            ),
        );
        m.virtual_member = true;
        m
    });

    // System.Array
    let array = {
        let mut t = TypeDef::new(Some("System"), "Array");
        t.extends = Some(object.into());
        t.flags.abstract_type = true;
        image.push_type_definition(t)
    };
    image.push_method(array, {
        let mut m = MethodDef::internal(
            "get_Length",
            MethodSignature::instance_method(vec![], Some(value(int_type()))),
        );
        m.special_name = true;
        m
    });

    // System.Delegate, System.MulticastDelegate
    let delegate = {
        let mut t = TypeDef::new(Some("System"), "Delegate");
        t.extends = Some(object.into());
        t.flags.abstract_type = true;
        image.push_type_definition(t)
    };
    let delegate_type = MethodType::class(delegate);
    image.push_method(
        delegate,
        MethodDef::internal(
            "Combine",
            MethodSignature::static_method(
                vec![value(delegate_type.clone()), value(delegate_type.clone())],
                Some(value(delegate_type.clone())),
            ),
        ),
    );
    image.push_method(
        delegate,
        MethodDef::internal(
            "Remove",
            MethodSignature::static_method(
                vec![value(delegate_type.clone()), value(delegate_type.clone())],
                Some(value(delegate_type)),
            ),
        ),
    );
    {
        let mut t = TypeDef::new(Some("System"), "MulticastDelegate");
        t.extends = Some(delegate.into());
        t.flags.abstract_type = true;
        image.push_type_definition(t);
    }

    // System.Type, System.RuntimeType, System.RuntimeTypeHandle
    let type_class = {
        let mut t = TypeDef::new(Some("System"), "Type");
        t.extends = Some(object.into());
        t.flags.abstract_type = true;
        image.push_type_definition(t)
    };
    let handle_struct = {
        let mut t = TypeDef::new(Some("System"), "RuntimeTypeHandle");
        t.extends = Some(value_type.into());
        image.push_type_definition(t)
    };
    {
        let mut f = Field::new("m_type", BaseType::IntPtr.into());
        f.runtime_special_name = true;
        image.push_field(handle_struct, f);
    }
    image.push_method(
        type_class,
        MethodDef::internal(
            "GetTypeFromHandle",
            MethodSignature::static_method(
                vec![value(MethodType::class(handle_struct))],
                Some(value(MethodType::class(type_class))),
            ),
        ),
    );
    image.push_method(type_class, {
        let mut m = MethodDef::internal(
            "op_Equality",
            MethodSignature::static_method(
                vec![
                    value(MethodType::class(type_class)),
                    value(MethodType::class(type_class)),
                ],
                Some(value(BaseType::Boolean.into())),
            ),
        );
        m.special_name = true;
        m
    });
    image.push_method(type_class, {
        let mut m = MethodDef::internal(
            "get_FullName",
            MethodSignature::instance_method(vec![], Some(value(string_type()))),
        );
        m.special_name = true;
        m
    });
    let runtime_type = {
        let mut t = TypeDef::new(Some("System"), "RuntimeType");
        t.extends = Some(type_class.into());
        t.flags.sealed = true;
        image.push_type_definition(t)
    };
    {
        let mut f = Field::new("m_handle", BaseType::IntPtr.into());
        f.runtime_special_name = true;
        image.push_field(runtime_type, f);
    }

    // Primitive value types
    for name in [
        "Boolean", "Char", "SByte", "Byte", "Int16", "UInt16", "Int32", "UInt32", "Int64",
        "UInt64", "Single", "Double", "IntPtr", "UIntPtr",
    ] {
        let idx = {
            let mut t = TypeDef::new(Some("System"), name);
            t.extends = Some(value_type.into());
            t.flags.sealed = true;
            image.push_type_definition(t)
        };
        image.push_method(idx, {
            let mut m = MethodDef::internal(
                "Equals",
                MethodSignature::instance_method(
                    vec![value(object_type())],
                    Some(value(BaseType::Boolean.into())),
                ),
            );
            m.virtual_member = true;
            m
        });
        image.push_method(idx, {
            let mut m = MethodDef::internal(
                "GetHashCode",
                MethodSignature::instance_method(vec![], Some(value(int_type()))),
            );
            m.virtual_member = true;
            m
        });
    }

    // System.Exception and the standard exception hierarchy
    let exception = {
        let mut t = TypeDef::new(Some("System"), "Exception");
        t.extends = Some(object.into());
        image.push_type_definition(t)
    };
    let message_field = image.push_field(exception, Field::new("_message", string_type()));
    let stack_trace_field = image.push_field(exception, Field::new("_stackTrace", string_type()));
    image.push_method(
        exception,
        MethodDef::constructor(
            MethodSignature::instance_method(vec![], None),
            MethodBody::with_instructions(vec![Instruction::Return]),
        ),
    );
    let exception_string_ctor = image.push_method(
        exception,
        MethodDef::constructor(
            MethodSignature::instance_method(vec![value(string_type())], None),
            MethodBody::with_instructions(vec![
                Instruction::LoadArgument(0),
                Instruction::LoadArgument(1),
                Instruction::StoreField(message_field.into()),
                Instruction::Return,
            ]),
        ),
    );
    image.push_method(exception, {
        let mut m = MethodDef::new(
            "get_Message",
            MethodSignature::instance_method(vec![], Some(value(string_type()))),
            Some(MethodBody::with_instructions(vec![
                Instruction::LoadArgument(0),
                Instruction::LoadField(message_field.into()),
                Instruction::Return,
            ])),
        );
        m.special_name = true;
        m
    });
    image.push_method(exception, {
        let mut m = MethodDef::new(
            "get_StackTrace",
            MethodSignature::instance_method(vec![], Some(value(string_type()))),
            Some(MethodBody::with_instructions(vec![
                Instruction::LoadArgument(0),
                Instruction::LoadField(stack_trace_field.into()),
                Instruction::Return,
            ])),
        );
        m.special_name = true;
        m
    });

    let push_exception = |image: &mut Image, name: &str, base: TypeIndex| {
        let idx = {
            let mut t = TypeDef::new(Some("System"), name);
            t.extends = Some(base.into());
            image.push_type_definition(t)
        };
        image.push_method(
            idx,
            MethodDef::constructor(
                MethodSignature::instance_method(vec![], None),
                MethodBody::with_instructions(vec![Instruction::Return]),
            ),
        );
        image.push_method(
            idx,
            MethodDef::constructor(
                MethodSignature::instance_method(vec![value(string_type())], None),
                MethodBody::with_instructions(vec![
                    Instruction::LoadArgument(0),
                    Instruction::LoadArgument(1),
                    Instruction::call(UserMethod::Definition(exception_string_ctor)),
                    Instruction::Return,
                ]),
            ),
        );
        idx
    };

    let arithmetic = push_exception(&mut image, "ArithmeticException", exception);
    push_exception(&mut image, "OverflowException", arithmetic);
    push_exception(&mut image, "DivideByZeroException", arithmetic);
    for name in [
        "NullReferenceException",
        "InvalidCastException",
        "IndexOutOfRangeException",
        "InvalidOperationException",
        "NotSupportedException",
        "StackOverflowException",
        "OutOfMemoryException",
        "TypeInitializationException",
    ] {
        push_exception(&mut image, name, exception);
    }

    image
}
