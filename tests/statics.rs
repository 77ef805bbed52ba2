//! Static storage and the static-constructor discipline.

mod common;

use cilvm::metadata::Instruction::*;
use cilvm::metadata::*;
use cilvm::value::StackValue;
use common::*;

struct CountedImage {
    image: Image,
    get: MethodIndex,
    read_direct: MethodIndex,
}

/// `class Counted { static int Count; static Counted() { Count++; }
/// static int Get() => Count; }` plus a second type reading the field.
fn counted_image() -> CountedImage {
    let mut image = Image::new("StaticTests");

    let counted = {
        let mut t = TypeDef::new(None, "Counted");
        t.extends = Some(object_base());
        image.push_type_definition(t)
    };
    let count = image.push_field(counted, Field::static_field("Count", int()));
    image.push_method(counted, {
        let mut m = MethodDef::new(
            ".cctor",
            static_sig(vec![], None),
            Some(body(vec![
                LoadStaticField(count.into()),
                LoadConstantInt32(1),
                Add,
                StoreStaticField(count.into()),
                Return,
            ])),
        );
        m.special_name = true;
        m.runtime_special_name = true;
        m
    });
    let get = image.push_method(
        counted,
        MethodDef::new(
            "Get",
            static_sig(vec![], Some(int())),
            Some(body(vec![LoadStaticField(count.into()), Return])),
        ),
    );

    let program = {
        let mut t = TypeDef::new(None, "Program");
        t.extends = Some(object_base());
        image.push_type_definition(t)
    };
    let read_direct = image.push_method(
        program,
        MethodDef::new(
            "ReadCount",
            static_sig(vec![], Some(int())),
            Some(body(vec![LoadStaticField(count.into()), Return])),
        ),
    );

    CountedImage {
        image,
        get,
        read_direct,
    }
}

#[test]
fn static_constructor_runs_exactly_once() {
    let c = counted_image();
    let mut h = Harness::new(c.image);

    // the first use runs the initializer; later uses observe the same state
    assert_eq!(h.call_int(c.get, vec![]), 1);
    assert_eq!(h.call_int(c.get, vec![]), 1);
    assert_eq!(h.call_int(c.get, vec![]), 1);
}

#[test]
fn field_access_from_another_type_also_triggers_the_initializer_once() {
    let c = counted_image();
    let mut h = Harness::new(c.image);

    assert_eq!(h.call_int(c.read_direct, vec![]), 1);
    assert_eq!(h.call_int(c.get, vec![]), 1);
}

#[test]
fn static_field_defaults_apply_before_the_initializer() {
    let mut image = Image::new("DefaultTests");
    let ty = {
        let mut t = TypeDef::new(None, "Defaults");
        t.extends = Some(object_base());
        image.push_type_definition(t)
    };
    let seed = image.push_field(ty, {
        let mut f = Field::static_field("Seed", int());
        f.default = Some(Constant::Int32(40));
        f
    });
    image.push_method(ty, {
        let mut m = MethodDef::new(
            ".cctor",
            static_sig(vec![], None),
            Some(body(vec![
                LoadStaticField(seed.into()),
                LoadConstantInt32(2),
                Add,
                StoreStaticField(seed.into()),
                Return,
            ])),
        );
        m.special_name = true;
        m.runtime_special_name = true;
        m
    });
    let get = image.push_method(
        ty,
        MethodDef::new(
            "Get",
            static_sig(vec![], Some(int())),
            Some(body(vec![LoadStaticField(seed.into()), Return])),
        ),
    );

    let mut h = Harness::new(image);
    assert_eq!(h.call_int(get, vec![]), 42);
}

#[test]
fn statics_are_shared_between_interpreters_over_one_state() {
    let c = counted_image();
    let mut h = Harness::new(c.image);
    assert_eq!(h.call_int(c.get, vec![]), 1);

    // a second interpreter over the same shared state sees the same statics
    let mut second = cilvm::Interpreter::with_shared(h.interpreter.shared().clone());
    let method = h.method(c.get);
    match second.call(method, vec![]) {
        Ok(StackValue::Int32(v)) => assert_eq!(v, 1),
        other => panic!("expected int32, got {:?}", other),
    }
}

#[test]
fn instance_creation_triggers_the_initializer() {
    let mut image = Image::new("CtorTriggerTests");
    let ty = {
        let mut t = TypeDef::new(None, "Tracked");
        t.extends = Some(object_base());
        image.push_type_definition(t)
    };
    let created = image.push_field(ty, Field::static_field("Created", int()));
    image.push_method(ty, {
        let mut m = MethodDef::new(
            ".cctor",
            static_sig(vec![], None),
            Some(body(vec![
                LoadConstantInt32(5),
                StoreStaticField(created.into()),
                Return,
            ])),
        );
        m.special_name = true;
        m.runtime_special_name = true;
        m
    });
    let ctor = image.push_method(
        ty,
        MethodDef::constructor(instance_sig(vec![], None), body(vec![Return])),
    );

    let program = {
        let mut t = TypeDef::new(None, "Program");
        t.extends = Some(object_base());
        image.push_type_definition(t)
    };
    let make = image.push_method(
        program,
        MethodDef::new(
            "MakeAndRead",
            static_sig(vec![], Some(int())),
            Some(body(vec![
                NewObject(ctor.into()),
                Pop,
                LoadStaticField(created.into()),
                Return,
            ])),
        ),
    );

    let mut h = Harness::new(image);
    assert_eq!(h.call_int(make, vec![]), 5);
}
