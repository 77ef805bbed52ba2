//! Arithmetic, branches, conversions, and the numeric exception paths.

mod common;

use cilvm::metadata::Instruction::*;
use cilvm::metadata::*;
use cilvm::value::StackValue;
use common::*;

fn program(build: impl FnOnce(&mut Image, TypeIndex)) -> Image {
    let mut image = Image::new("ArithmeticTests");
    let program = {
        let mut t = TypeDef::new(None, "Program");
        t.extends = Some(object_base());
        image.push_type_definition(t)
    };
    build(&mut image, program);
    image
}

#[test]
fn factorial_by_recursion() {
    let mut fact_index = MethodIndex {
        parent: TypeIndex(0),
        member: 0,
    };
    let image = program(|image, ty| {
        // int Fact(int n) => n <= 1 ? 1 : n * Fact(n - 1)
        fact_index = image.push_method(
            ty,
            MethodDef::new(
                "Fact",
                static_sig(vec![int()], Some(int())),
                Some(body(vec![
                    LoadArgument(0),
                    LoadConstantInt32(1),
                    BranchLessOrEqual(NumberSign::Signed, 10),
                    LoadArgument(0),
                    LoadArgument(0),
                    LoadConstantInt32(1),
                    Subtract,
                    Instruction::call(MethodIndex {
                        parent: ty,
                        member: 0,
                    }),
                    Multiply,
                    Return,
                    // 10: base case
                    LoadConstantInt32(1),
                    Return,
                ])),
            ),
        );
    });

    let mut h = Harness::new(image);
    assert_eq!(h.call_int(fact_index, vec![StackValue::Int32(5)]), 120);
    assert_eq!(h.call_int(fact_index, vec![StackValue::Int32(0)]), 1);
    assert_eq!(
        h.call_int(fact_index, vec![StackValue::Int32(12)]),
        479001600
    );
}

#[test]
fn factorial_base_case_returns_through_shared_ret() {
    // the branch target above lands on `ldc.i4.1; ret`, which the recursive
    // path also flows through after `mul` -- make sure both stack shapes
    // agree there
    let mut fact = MethodIndex {
        parent: TypeIndex(0),
        member: 0,
    };
    let image = program(|image, ty| {
        fact = image.push_method(
            ty,
            MethodDef::new(
                "Fact",
                static_sig(vec![int()], Some(int())),
                Some(body(vec![
                    LoadArgument(0),
                    LoadConstantInt32(1),
                    BranchGreater(NumberSign::Signed, 5),
                    // base case
                    LoadConstantInt32(1),
                    Branch(11),
                    // 5: recursive case
                    LoadArgument(0),
                    LoadArgument(0),
                    LoadConstantInt32(1),
                    Subtract,
                    Instruction::call(MethodIndex {
                        parent: ty,
                        member: 0,
                    }),
                    Multiply,
                    // 11: both paths agree on one int32
                    Return,
                ])),
            ),
        );
    });

    let mut h = Harness::new(image);
    assert_eq!(h.call_int(fact, vec![StackValue::Int32(6)]), 720);
}

#[test]
fn division_follows_ecma_semantics() {
    let mut div = MethodIndex {
        parent: TypeIndex(0),
        member: 0,
    };
    let mut div_unsigned = div;
    let mut rem = div;
    let image = program(|image, ty| {
        div = image.push_method(
            ty,
            MethodDef::new(
                "Div",
                static_sig(vec![int(), int()], Some(int())),
                Some(body(vec![
                    LoadArgument(0),
                    LoadArgument(1),
                    Divide(NumberSign::Signed),
                    Return,
                ])),
            ),
        );
        div_unsigned = image.push_method(
            ty,
            MethodDef::new(
                "DivUn",
                static_sig(vec![int(), int()], Some(int())),
                Some(body(vec![
                    LoadArgument(0),
                    LoadArgument(1),
                    Divide(NumberSign::Unsigned),
                    Return,
                ])),
            ),
        );
        rem = image.push_method(
            ty,
            MethodDef::new(
                "Rem",
                static_sig(vec![int(), int()], Some(int())),
                Some(body(vec![
                    LoadArgument(0),
                    LoadArgument(1),
                    Remainder(NumberSign::Signed),
                    Return,
                ])),
            ),
        );
    });

    let mut h = Harness::new(image);
    assert_eq!(
        h.call_int(div, vec![StackValue::Int32(-7), StackValue::Int32(2)]),
        -3
    );
    assert_eq!(
        h.call_int(
            div_unsigned,
            vec![StackValue::Int32(-2), StackValue::Int32(2)]
        ),
        0x7FFF_FFFF
    );
    assert_eq!(
        h.call_int(rem, vec![StackValue::Int32(-7), StackValue::Int32(2)]),
        -1
    );

    assert_eq!(
        h.expect_unhandled(div, vec![StackValue::Int32(1), StackValue::Int32(0)]),
        "System.DivideByZeroException"
    );
    assert_eq!(
        h.expect_unhandled(
            div,
            vec![StackValue::Int32(i32::MIN), StackValue::Int32(-1)]
        ),
        "System.OverflowException"
    );
}

#[test]
fn checked_arithmetic_raises_overflow() {
    let mut add_ovf = MethodIndex {
        parent: TypeIndex(0),
        member: 0,
    };
    let image = program(|image, ty| {
        add_ovf = image.push_method(
            ty,
            MethodDef::new(
                "AddOvf",
                static_sig(vec![int(), int()], Some(int())),
                Some(body(vec![
                    LoadArgument(0),
                    LoadArgument(1),
                    AddOverflow(NumberSign::Signed),
                    Return,
                ])),
            ),
        );
    });

    let mut h = Harness::new(image);
    assert_eq!(
        h.call_int(add_ovf, vec![StackValue::Int32(40), StackValue::Int32(2)]),
        42
    );
    assert_eq!(
        h.expect_unhandled(
            add_ovf,
            vec![StackValue::Int32(i32::MAX), StackValue::Int32(1)]
        ),
        "System.OverflowException"
    );
}

#[test]
fn conversions_truncate_and_check() {
    let mut conv = MethodIndex {
        parent: TypeIndex(0),
        member: 0,
    };
    let mut conv_ovf = conv;
    let mut float_trunc = conv;
    let image = program(|image, ty| {
        conv = image.push_method(
            ty,
            MethodDef::new(
                "ConvU1",
                static_sig(vec![int()], Some(int())),
                Some(body(vec![
                    LoadArgument(0),
                    Convert(ConversionType::UInt8),
                    Return,
                ])),
            ),
        );
        conv_ovf = image.push_method(
            ty,
            MethodDef::new(
                "ConvOvfU1",
                static_sig(vec![int()], Some(int())),
                Some(body(vec![
                    LoadArgument(0),
                    ConvertOverflow(ConversionType::UInt8, NumberSign::Signed),
                    Return,
                ])),
            ),
        );
        float_trunc = image.push_method(
            ty,
            MethodDef::new(
                "Trunc",
                static_sig(vec![float64()], Some(int())),
                Some(body(vec![
                    LoadArgument(0),
                    Convert(ConversionType::Int32),
                    Return,
                ])),
            ),
        );
    });

    let mut h = Harness::new(image);
    assert_eq!(h.call_int(conv, vec![StackValue::Int32(0x1FF)]), 0xFF);
    assert_eq!(
        h.expect_unhandled(conv_ovf, vec![StackValue::Int32(300)]),
        "System.OverflowException"
    );
    assert_eq!(
        h.call_int(float_trunc, vec![StackValue::NativeFloat(-2.75)]),
        -2
    );
}

#[test]
fn switch_selects_by_index() {
    let mut pick = MethodIndex {
        parent: TypeIndex(0),
        member: 0,
    };
    let image = program(|image, ty| {
        pick = image.push_method(
            ty,
            MethodDef::new(
                "Pick",
                static_sig(vec![int()], Some(int())),
                Some(body(vec![
                    LoadArgument(0),
                    Switch(vec![4, 6, 8]),
                    // fallthrough
                    LoadConstantInt32(-1),
                    Return,
                    // 4:
                    LoadConstantInt32(10),
                    Return,
                    // 6:
                    LoadConstantInt32(20),
                    Return,
                    // 8:
                    LoadConstantInt32(30),
                    Return,
                ])),
            ),
        );
    });

    let mut h = Harness::new(image);
    assert_eq!(h.call_int(pick, vec![StackValue::Int32(0)]), 10);
    assert_eq!(h.call_int(pick, vec![StackValue::Int32(2)]), 30);
    assert_eq!(h.call_int(pick, vec![StackValue::Int32(9)]), -1);
    assert_eq!(h.call_int(pick, vec![StackValue::Int32(-1)]), -1);
}

#[test]
fn sub_word_locals_truncate_on_store() {
    let mut narrow = MethodIndex {
        parent: TypeIndex(0),
        member: 0,
    };
    let image = program(|image, ty| {
        // uint8 local; storing 0x1FF reads back 0xFF
        narrow = image.push_method(
            ty,
            MethodDef::new(
                "Narrow",
                static_sig(vec![], Some(int())),
                Some(body_with_locals(
                    vec![BaseType::UInt8.into()],
                    vec![
                        LoadConstantInt32(0x1FF),
                        StoreLocal(0),
                        LoadLocal(0),
                        Return,
                    ],
                )),
            ),
        );
    });

    let mut h = Harness::new(image);
    assert_eq!(h.call_int(narrow, vec![]), 0xFF);
}

#[test]
fn long_arithmetic_stays_in_int64() {
    let mut square = MethodIndex {
        parent: TypeIndex(0),
        member: 0,
    };
    let image = program(|image, ty| {
        square = image.push_method(
            ty,
            MethodDef::new(
                "SquareBig",
                static_sig(vec![long()], Some(long())),
                Some(body(vec![LoadArgument(0), LoadArgument(0), Multiply, Return])),
            ),
        );
    });

    let mut h = Harness::new(image);
    match h.call(square, vec![StackValue::Int64(1 << 31)]) {
        Ok(StackValue::Int64(v)) => assert_eq!(v, 1 << 62),
        other => panic!("expected int64, got {:?}", other),
    }
}

#[test]
fn invalid_invocations_are_rejected() {
    let mut fact = MethodIndex {
        parent: TypeIndex(0),
        member: 0,
    };
    let image = program(|image, ty| {
        fact = image.push_method(
            ty,
            MethodDef::new(
                "NeedsOneArg",
                static_sig(vec![int()], Some(int())),
                Some(body(vec![LoadArgument(0), Return])),
            ),
        );
    });

    let mut h = Harness::new(image);
    let method = h.method(fact);
    assert!(matches!(
        h.interpreter.call(method, vec![]),
        Err(cilvm::CallError::Invalid(_))
    ));
}
