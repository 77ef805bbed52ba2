//! Dispatch: virtual and non-virtual calls, interfaces, generics,
//! delegates, function pointers, and the recursion guard.

mod common;

use cilvm::metadata::Instruction::*;
use cilvm::metadata::*;
use cilvm::types::generics::ConcreteType;
use cilvm::value::{ObjectRef, StackValue};
use common::*;

#[test]
fn virtual_dispatch_picks_the_most_derived_override() {
    let mut image = Image::new("DispatchTests");

    // class A { virtual int M() => 1; }
    let a = {
        let mut t = TypeDef::new(None, "A");
        t.extends = Some(object_base());
        image.push_type_definition(t)
    };
    let a_ctor = image.push_method(
        a,
        MethodDef::constructor(instance_sig(vec![], None), body(vec![Return])),
    );
    let a_m = image.push_method(
        a,
        MethodDef::virtual_method(
            "M",
            instance_sig(vec![], Some(int())),
            Some(body(vec![LoadConstantInt32(1), Return])),
        ),
    );
    let _ = a_ctor;

    // class B : A { override int M() => 2; }
    let b = {
        let mut t = TypeDef::new(None, "B");
        t.extends = Some(a.into());
        image.push_type_definition(t)
    };
    let b_ctor = image.push_method(
        b,
        MethodDef::constructor(instance_sig(vec![], None), body(vec![Return])),
    );
    image.push_method(
        b,
        MethodDef::virtual_method(
            "M",
            instance_sig(vec![], Some(int())),
            Some(body(vec![LoadConstantInt32(2), Return])),
        ),
    );

    let program = {
        let mut t = TypeDef::new(None, "Program");
        t.extends = Some(object_base());
        image.push_type_definition(t)
    };

    // callvirt A::M on a B instance
    let virt = image.push_method(
        program,
        MethodDef::new(
            "CallVirt",
            static_sig(vec![], Some(int())),
            Some(body(vec![
                NewObject(b_ctor.into()),
                Instruction::call_virtual(a_m),
                Return,
            ])),
        ),
    );
    // call A::M on the same instance: statically bound
    let direct = image.push_method(
        program,
        MethodDef::new(
            "CallDirect",
            static_sig(vec![], Some(int())),
            Some(body(vec![
                NewObject(b_ctor.into()),
                Instruction::call(a_m),
                Return,
            ])),
        ),
    );

    let mut h = Harness::new(image);
    assert_eq!(h.call_int(virt, vec![]), 2);
    assert_eq!(h.call_int(direct, vec![]), 1);
}

#[test]
fn interface_dispatch_finds_the_implementation() {
    let mut image = Image::new("InterfaceTests");

    // interface IShape { int Sides(); }
    let shape = {
        let mut t = TypeDef::new(None, "IShape");
        t.flags.interface = true;
        t.flags.abstract_type = true;
        image.push_type_definition(t)
    };
    let sides_decl = image.push_method(shape, {
        let mut m = MethodDef::virtual_method("Sides", instance_sig(vec![], Some(int())), None);
        m.abstract_member = true;
        m
    });

    // class Square : IShape { virtual int Sides() => 4; }
    let square = {
        let mut t = TypeDef::new(None, "Square");
        t.extends = Some(object_base());
        t.implements = vec![shape.into()];
        image.push_type_definition(t)
    };
    let square_ctor = image.push_method(
        square,
        MethodDef::constructor(instance_sig(vec![], None), body(vec![Return])),
    );
    image.push_method(
        square,
        MethodDef::virtual_method(
            "Sides",
            instance_sig(vec![], Some(int())),
            Some(body(vec![LoadConstantInt32(4), Return])),
        ),
    );

    let program = {
        let mut t = TypeDef::new(None, "Program");
        t.extends = Some(object_base());
        image.push_type_definition(t)
    };
    let call_iface = image.push_method(
        program,
        MethodDef::new(
            "SidesOfSquare",
            static_sig(vec![], Some(int())),
            Some(body(vec![
                NewObject(square_ctor.into()),
                Instruction::call_virtual(sides_decl),
                Return,
            ])),
        ),
    );

    let mut h = Harness::new(image);
    assert_eq!(h.call_int(call_iface, vec![]), 4);
}

#[test]
fn generic_identity_preserves_object_identity() {
    let mut image = Image::new("GenericTests");
    let program = {
        let mut t = TypeDef::new(None, "Program");
        t.extends = Some(object_base());
        image.push_type_definition(t)
    };
    // T Id<T>(T x) => x
    let id = image.push_method(program, {
        let mut m = MethodDef::new(
            "Id",
            static_sig(vec![MethodType::MethodGeneric(0)], Some(MethodType::MethodGeneric(0))),
            Some(body(vec![LoadArgument(0), Return])),
        );
        m.generic_parameters = vec![GenericParameter::new("T")];
        m
    });

    let mut h = Harness::new(image);
    let method = h.method(id);
    let string_ty: ConcreteType = h
        .interpreter
        .assemblies()
        .corlib_type("System.String")
        .unwrap()
        .into();

    let input = ObjectRef::string("hello");
    let result = h
        .interpreter
        .call_generic(
            vec![],
            method,
            vec![string_ty],
            None,
            vec![StackValue::ObjectRef(input.clone())],
        )
        .unwrap();

    // same object identity, not a copy
    match result {
        StackValue::ObjectRef(o) => assert!(o == input),
        other => panic!("expected an object reference, got {:?}", other),
    }
}

#[test]
fn generic_instantiations_intern_to_one_identity() {
    let h = Harness::new(Image::new("InternTests"));
    let world = h.interpreter.assemblies();
    let int32 = ConcreteType::new(world.corlib(), BaseType::Int32);
    let a = world.intern(ConcreteType::new(
        world.corlib(),
        BaseType::Vector(world.intern(int32.clone())),
    ));
    let b = world.intern(ConcreteType::new(
        world.corlib(),
        BaseType::Vector(world.intern(int32)),
    ));
    assert!(a.same_identity(&b));
}

#[test]
fn generic_type_binds_fields_through_the_scope() {
    let mut image = Image::new("GenericHolder");

    // class Holder<T> { T value; Holder(T v); T Get(); }
    let holder = {
        let mut t = TypeDef::new(None, "Holder");
        t.extends = Some(object_base());
        t.generic_parameters = vec![GenericParameter::new("T")];
        image.push_type_definition(t)
    };
    let value_field = image.push_field(holder, Field::new("value", MethodType::TypeGeneric(0)));
    image.push_method(
        holder,
        MethodDef::constructor(
            instance_sig(vec![MethodType::TypeGeneric(0)], None),
            body(vec![
                LoadArgument(0),
                LoadArgument(1),
                StoreField(value_field.into()),
                Return,
            ]),
        ),
    );
    image.push_method(
        holder,
        MethodDef::new(
            "Get",
            instance_sig(vec![], Some(MethodType::TypeGeneric(0))),
            Some(body(vec![
                LoadArgument(0),
                LoadField(value_field.into()),
                Return,
            ])),
        ),
    );

    let program = {
        let mut t = TypeDef::new(None, "Program");
        t.extends = Some(object_base());
        image.push_type_definition(t)
    };

    let holder_of_int = MethodType::class(TypeSource::Generic {
        base: UserType::Definition(holder),
        parameters: vec![int()],
    });
    let ctor_ref = UserMethod::Reference(Box::new(MethodRef {
        parent: holder_of_int.clone(),
        name: ".ctor".to_string(),
        signature: instance_sig(vec![MethodType::TypeGeneric(0)], None),
    }));
    let get_ref = UserMethod::Reference(Box::new(MethodRef {
        parent: holder_of_int,
        name: "Get".to_string(),
        signature: instance_sig(vec![], Some(MethodType::TypeGeneric(0))),
    }));

    let round = image.push_method(
        program,
        MethodDef::new(
            "HoldAndGet",
            static_sig(vec![int()], Some(int())),
            Some(body(vec![
                LoadArgument(0),
                NewObject(ctor_ref),
                Instruction::call(get_ref),
                Return,
            ])),
        ),
    );

    let mut h = Harness::new(image);
    assert_eq!(h.call_int(round, vec![StackValue::Int32(77)]), 77);
}

fn delegate_image() -> (Image, TypeIndex, MethodIndex, MethodIndex, TypeIndex) {
    let mut image = Image::new("DelegateTests");

    // delegate int IntOp(int x)
    let int_op = {
        let mut t = TypeDef::new(None, "IntOp");
        t.extends = Some(UserType::reference(
            cilvm::corlib::CORLIB_NAME,
            "System.MulticastDelegate",
        )
        .into());
        t.flags.sealed = true;
        image.push_type_definition(t)
    };
    let ctor = image.push_method(int_op, {
        let mut m = MethodDef::new(
            ".ctor",
            instance_sig(vec![object(), BaseType::IntPtr.into()], None),
            None,
        );
        m.special_name = true;
        m.runtime_special_name = true;
        m
    });
    let invoke = image.push_method(int_op, {
        let mut m = MethodDef::virtual_method("Invoke", instance_sig(vec![int()], Some(int())), None);
        m.special_name = true;
        m
    });

    let program = {
        let mut t = TypeDef::new(None, "Program");
        t.extends = Some(object_base());
        image.push_type_definition(t)
    };
    (image, int_op, ctor, invoke, program)
}

#[test]
fn delegates_capture_and_invoke() {
    let (mut image, _int_op, ctor, invoke, program) = delegate_image();

    let double = image.push_method(
        program,
        MethodDef::new(
            "Double",
            static_sig(vec![int()], Some(int())),
            Some(body(vec![
                LoadArgument(0),
                LoadConstantInt32(2),
                Multiply,
                Return,
            ])),
        ),
    );

    let apply = image.push_method(
        program,
        MethodDef::new(
            "Apply",
            static_sig(vec![int()], Some(int())),
            Some(body(vec![
                LoadNull,
                LoadMethodPointer(double.into()),
                NewObject(ctor.into()),
                LoadArgument(0),
                Instruction::call_virtual(invoke),
                Return,
            ])),
        ),
    );

    let mut h = Harness::new(image);
    assert_eq!(h.call_int(apply, vec![StackValue::Int32(21)]), 42);
}

#[test]
fn multicast_invokes_in_order_and_returns_the_last_result() {
    let (mut image, _int_op, ctor, invoke, program) = delegate_image();

    // a static log the targets append to
    let log = image.push_field(program, Field::static_field("Log", int()));

    // each target records itself: Log = Log * 10 + k, then returns k
    let mut target = |image: &mut Image, name: &str, k: i32| {
        image.push_method(
            program,
            MethodDef::new(
                name,
                static_sig(vec![int()], Some(int())),
                Some(body(vec![
                    LoadStaticField(log.into()),
                    LoadConstantInt32(10),
                    Multiply,
                    LoadConstantInt32(k),
                    Add,
                    StoreStaticField(log.into()),
                    LoadConstantInt32(k),
                    Return,
                ])),
            ),
        )
    };
    let first = target(&mut image, "First", 1);
    let second = target(&mut image, "Second", 2);

    let combined = image.push_method(
        program,
        MethodDef::new(
            "RunCombined",
            static_sig(vec![], Some(int())),
            Some(body_with_locals(
                vec![MethodType::class(TypeIndex(0)), MethodType::class(TypeIndex(0))],
                vec![
                    LoadNull,
                    LoadMethodPointer(first.into()),
                    NewObject(ctor.into()),
                    StoreLocal(0),
                    LoadNull,
                    LoadMethodPointer(second.into()),
                    NewObject(ctor.into()),
                    StoreLocal(1),
                    LoadLocal(0),
                    LoadLocal(1),
                    Instruction::call(corlib_method(
                        "System.Delegate",
                        "Combine",
                        static_sig(
                            vec![
                                corlib_class("System.Delegate"),
                                corlib_class("System.Delegate"),
                            ],
                            Some(corlib_class("System.Delegate")),
                        ),
                    )),
                    CastClass(MethodType::class(TypeIndex(0))),
                    LoadConstantInt32(0),
                    Instruction::call_virtual(invoke),
                    Return,
                ],
            )),
        ),
    );
    let read_log = image.push_method(
        program,
        MethodDef::new(
            "ReadLog",
            static_sig(vec![], Some(int())),
            Some(body(vec![LoadStaticField(log.into()), Return])),
        ),
    );

    let mut h = Harness::new(image);
    // last target's result comes back
    assert_eq!(h.call_int(combined, vec![]), 2);
    // and both ran, in insertion order
    assert_eq!(h.call_int(read_log, vec![]), 12);
}

#[test]
fn function_pointers_round_trip_through_calli() {
    let mut image = Image::new("CalliTests");
    let program = {
        let mut t = TypeDef::new(None, "Program");
        t.extends = Some(object_base());
        image.push_type_definition(t)
    };
    let add_one = image.push_method(
        program,
        MethodDef::new(
            "AddOne",
            static_sig(vec![int()], Some(int())),
            Some(body(vec![
                LoadArgument(0),
                LoadConstantInt32(1),
                Add,
                Return,
            ])),
        ),
    );
    let indirect = image.push_method(
        program,
        MethodDef::new(
            "CallIndirectly",
            static_sig(vec![int()], Some(int())),
            Some(body(vec![
                LoadArgument(0),
                LoadMethodPointer(add_one.into()),
                CallIndirect {
                    signature: static_sig(vec![int()], Some(int())),
                },
                Return,
            ])),
        ),
    );

    let mut h = Harness::new(image);
    assert_eq!(h.call_int(indirect, vec![StackValue::Int32(41)]), 42);
}

#[test]
fn runaway_recursion_raises_stack_overflow() {
    let mut image = Image::new("RecursionTests");
    let program = {
        let mut t = TypeDef::new(None, "Program");
        t.extends = Some(object_base());
        image.push_type_definition(t)
    };
    let spin = image.push_method(
        program,
        MethodDef::new(
            "Spin",
            static_sig(vec![], None),
            Some(body(vec![
                Instruction::call(MethodIndex {
                    parent: program,
                    member: 0,
                }),
                Return,
            ])),
        ),
    );

    let mut h = Harness::new(image);
    h.interpreter.set_max_call_depth(64);
    assert_eq!(
        h.expect_unhandled(spin, vec![]),
        "System.StackOverflowException"
    );
}
