//! Protected regions: catch matching, finally ordering, filters, rethrow,
//! and `leave` semantics.

mod common;

use cilvm::metadata::Instruction::*;
use cilvm::metadata::*;
use cilvm::value::StackValue;
use common::*;

struct ExcImage {
    image: Image,
    program: TypeIndex,
    marker: FieldIndex,
    read_marker: MethodIndex,
}

fn exc_image() -> ExcImage {
    let mut image = Image::new("ExceptionTests");
    let program = {
        let mut t = TypeDef::new(None, "Program");
        t.extends = Some(object_base());
        image.push_type_definition(t)
    };
    let marker = image.push_field(program, Field::static_field("Marker", int()));
    let read_marker = image.push_method(
        program,
        MethodDef::new(
            "ReadMarker",
            static_sig(vec![], Some(int())),
            Some(body(vec![LoadStaticField(marker.into()), Return])),
        ),
    );
    ExcImage {
        image,
        program,
        marker,
        read_marker,
    }
}

/// Append a digit to the static marker: `Marker = Marker * 10 + k`.
fn mark(marker: FieldIndex, k: i32) -> Vec<Instruction> {
    vec![
        LoadStaticField(marker.into()),
        LoadConstantInt32(10),
        Multiply,
        LoadConstantInt32(k),
        Add,
        StoreStaticField(marker.into()),
    ]
}

#[test]
fn catch_matches_by_assignability() {
    let mut e = exc_image();
    // throw DivideByZeroException, catch ArithmeticException (its base)
    let caught = {
        let instructions = vec![
            // try: 0..3
            NewObject(corlib_ctor("System.DivideByZeroException", vec![])),
            Throw,
            Leave(7),
            // handler: 3..7 (exception on stack)
            Pop,
            LoadConstantInt32(7),
            StoreLocal(0),
            Leave(7),
            // 7:
            LoadLocal(0),
            Return,
        ];
        let mut b = body_with_locals(vec![int()], instructions);
        b.exceptions = vec![ExceptionClause {
            try_offset: 0,
            try_length: 3,
            handler_offset: 3,
            handler_length: 4,
            kind: ExceptionKind::TypedException(corlib_class("System.ArithmeticException")),
        }];
        e.image.push_method(
            e.program,
            MethodDef::new("CatchBase", static_sig(vec![], Some(int())), Some(b)),
        )
    };

    let mut h = Harness::new(e.image);
    assert_eq!(h.call_int(caught, vec![]), 7);
}

#[test]
fn unrelated_catch_does_not_match() {
    let mut e = exc_image();
    let uncaught = {
        let mut b = body_with_locals(
            vec![int()],
            vec![
                NewObject(corlib_ctor("System.InvalidOperationException", vec![])),
                Throw,
                Leave(7),
                Pop,
                LoadConstantInt32(7),
                StoreLocal(0),
                Leave(7),
                LoadLocal(0),
                Return,
            ],
        );
        b.exceptions = vec![ExceptionClause {
            try_offset: 0,
            try_length: 3,
            handler_offset: 3,
            handler_length: 4,
            kind: ExceptionKind::TypedException(corlib_class("System.ArithmeticException")),
        }];
        e.image.push_method(
            e.program,
            MethodDef::new("NoMatch", static_sig(vec![], Some(int())), Some(b)),
        )
    };

    let mut h = Harness::new(e.image);
    assert_eq!(
        h.expect_unhandled(uncaught, vec![]),
        "System.InvalidOperationException"
    );
}

#[test]
fn nested_finally_blocks_run_inner_to_outer_and_the_exception_surfaces() {
    let mut e = exc_image();
    let marker = e.marker;

    // try { try { throw } finally { mark 1 } } finally { mark 2 }
    let mut instructions = vec![
        // inner try: 0..2
        NewObject(corlib_ctor("System.InvalidOperationException", vec![])),
        Throw,
    ];
    // inner finally handler: 2..9
    instructions.extend(mark(marker, 1));
    instructions.push(EndFinally);
    // outer finally handler: 9..16
    instructions.extend(mark(marker, 2));
    instructions.push(EndFinally);
    // unreachable normal exit: 16..18
    instructions.push(LoadConstantInt32(0));
    instructions.push(Return);

    let mut b = body(instructions);
    b.exceptions = vec![
        ExceptionClause {
            try_offset: 0,
            try_length: 2,
            handler_offset: 2,
            handler_length: 7,
            kind: ExceptionKind::Finally,
        },
        ExceptionClause {
            try_offset: 0,
            try_length: 9,
            handler_offset: 9,
            handler_length: 7,
            kind: ExceptionKind::Finally,
        },
    ];
    let nested = e.image.push_method(
        e.program,
        MethodDef::new("NestedFinally", static_sig(vec![], Some(int())), Some(b)),
    );
    let read_marker = e.read_marker;

    let mut h = Harness::new(e.image);
    assert_eq!(
        h.expect_unhandled(nested, vec![]),
        "System.InvalidOperationException"
    );
    // inner finally first, then outer
    assert_eq!(h.call_int(read_marker, vec![]), 12);
}

#[test]
fn finally_runs_on_the_normal_path_too() {
    let mut e = exc_image();
    let marker = e.marker;

    // try { x = 1; leave } finally { mark 5 }; return x
    let mut instructions = vec![
        // try: 0..3
        LoadConstantInt32(1),
        StoreLocal(0),
        Leave(10),
    ];
    // finally: 3..10
    instructions.extend(mark(marker, 5));
    instructions.push(EndFinally);
    // 10:
    instructions.push(LoadLocal(0));
    instructions.push(Return);

    let mut b = body_with_locals(vec![int()], instructions);
    b.exceptions = vec![ExceptionClause {
        try_offset: 0,
        try_length: 3,
        handler_offset: 3,
        handler_length: 7,
        kind: ExceptionKind::Finally,
    }];
    let leave_path = e.image.push_method(
        e.program,
        MethodDef::new("LeaveRunsFinally", static_sig(vec![], Some(int())), Some(b)),
    );
    let read_marker = e.read_marker;

    let mut h = Harness::new(e.image);
    assert_eq!(h.call_int(leave_path, vec![]), 1);
    assert_eq!(h.call_int(read_marker, vec![]), 5);
}

#[test]
fn exception_unwinds_across_frames_through_intervening_finally() {
    let mut e = exc_image();
    let marker = e.marker;

    // Thrower: throws inside try/finally; its finally runs during unwind
    let mut thrower_instructions = vec![
        NewObject(corlib_ctor("System.InvalidOperationException", vec![])),
        Throw,
    ];
    thrower_instructions.extend(mark(marker, 3));
    thrower_instructions.push(EndFinally);
    thrower_instructions.push(Return);
    let mut thrower_body = body(thrower_instructions);
    thrower_body.exceptions = vec![ExceptionClause {
        try_offset: 0,
        try_length: 2,
        handler_offset: 2,
        handler_length: 7,
        kind: ExceptionKind::Finally,
    }];
    let thrower = e.image.push_method(
        e.program,
        MethodDef::new("Thrower", static_sig(vec![], None), Some(thrower_body)),
    );

    // Catcher: calls Thrower inside try/catch and reports 9
    let mut catcher_body = body_with_locals(
        vec![int()],
        vec![
            // try: 0..2
            Instruction::call(thrower),
            Leave(6),
            // catch: 2..6
            Pop,
            LoadConstantInt32(9),
            StoreLocal(0),
            Leave(6),
            // 6:
            LoadLocal(0),
            Return,
        ],
    );
    catcher_body.exceptions = vec![ExceptionClause {
        try_offset: 0,
        try_length: 2,
        handler_offset: 2,
        handler_length: 4,
        kind: ExceptionKind::TypedException(corlib_class("System.Exception")),
    }];
    let catcher = e.image.push_method(
        e.program,
        MethodDef::new("Catcher", static_sig(vec![], Some(int())), Some(catcher_body)),
    );
    let read_marker = e.read_marker;

    let mut h = Harness::new(e.image);
    assert_eq!(h.call_int(catcher, vec![]), 9);
    // the thrower's finally ran while unwinding toward the catch
    assert_eq!(h.call_int(read_marker, vec![]), 3);
}

#[test]
fn filters_select_handlers_dynamically() {
    let mut e = exc_image();

    // try { throw InvalidOperation } filter(e is InvalidOperation) { 11 }
    let mut b = body_with_locals(
        vec![int()],
        vec![
            // try: 0..3
            NewObject(corlib_ctor("System.InvalidOperationException", vec![])),
            Throw,
            Leave(12),
            // filter clause: 3..9, leaves 0/1 via endfilter
            IsInstance(corlib_class("System.InvalidOperationException")),
            LoadNull,
            CompareEqual,
            LoadConstantInt32(1),
            Xor,
            EndFilter,
            // handler: 9..12 (exception on stack)
            Pop,
            LoadConstantInt32(11),
            StoreLocal(0),
            // 12:
            LoadLocal(0),
            Return,
        ],
    );
    b.exceptions = vec![ExceptionClause {
        try_offset: 0,
        try_length: 3,
        handler_offset: 9,
        handler_length: 3,
        kind: ExceptionKind::Filter { offset: 3 },
    }];
    let filtered = e.image.push_method(
        e.program,
        MethodDef::new("Filtered", static_sig(vec![], Some(int())), Some(b)),
    );

    let mut h = Harness::new(e.image);
    assert_eq!(h.call_int(filtered, vec![]), 11);
}

#[test]
fn rethrow_preserves_the_exception() {
    let mut e = exc_image();

    // catch { rethrow } surfaces the original exception type
    let mut b = body(vec![
        // try: 0..3
        NewObject(corlib_ctor("System.InvalidOperationException", vec![])),
        Throw,
        Leave(5),
        // catch: 3..5
        Pop,
        Rethrow,
        // 5:
        LoadConstantInt32(0),
        Return,
    ]);
    b.exceptions = vec![ExceptionClause {
        try_offset: 0,
        try_length: 3,
        handler_offset: 3,
        handler_length: 2,
        kind: ExceptionKind::TypedException(corlib_class("System.Exception")),
    }];
    let rethrower = e.image.push_method(
        e.program,
        MethodDef::new("Rethrower", static_sig(vec![], Some(int())), Some(b)),
    );

    let mut h = Harness::new(e.image);
    assert_eq!(
        h.expect_unhandled(rethrower, vec![]),
        "System.InvalidOperationException"
    );
}

#[test]
fn exception_message_travels_with_the_object() {
    let mut e = exc_image();
    let with_message = e.image.push_method(
        e.program,
        MethodDef::new(
            "ThrowWithMessage",
            static_sig(vec![], None),
            Some(body(vec![
                LoadString("deliberate".to_string()),
                NewObject(corlib_ctor("System.InvalidOperationException", vec![string()])),
                Throw,
            ])),
        ),
    );

    let mut h = Harness::new(e.image);
    let method = h.method(with_message);
    match h.interpreter.call(method, vec![]) {
        Err(cilvm::CallError::Unhandled {
            type_name, message, ..
        }) => {
            assert_eq!(type_name, "System.InvalidOperationException");
            assert_eq!(message, "deliberate");
        }
        other => panic!("expected unhandled, got {:?}", other.map(|v| format!("{:?}", v))),
    }
}

#[test]
fn throwing_null_raises_null_reference() {
    let mut e = exc_image();
    let throw_null = e.image.push_method(
        e.program,
        MethodDef::new(
            "ThrowNull",
            static_sig(vec![], None),
            Some(body(vec![LoadNull, Throw])),
        ),
    );

    let mut h = Harness::new(e.image);
    assert_eq!(
        h.expect_unhandled(throw_null, vec![]),
        "System.NullReferenceException"
    );
}

#[test]
fn null_field_access_raises_null_reference() {
    let mut e = exc_image();
    // reading Length of a null string via ldfld-style access path
    let deref_null = e.image.push_method(
        e.program,
        MethodDef::new(
            "DerefNull",
            static_sig(vec![], Some(int())),
            Some(body(vec![
                LoadNull,
                Instruction::call_virtual(corlib_method(
                    "System.String",
                    "get_Length",
                    instance_sig(vec![], Some(int())),
                )),
                Return,
            ])),
        ),
    );

    let mut h = Harness::new(e.image);
    assert_eq!(
        h.expect_unhandled(deref_null, vec![]),
        "System.NullReferenceException"
    );
}
