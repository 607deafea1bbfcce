use crate::common::{WAIT, echo_host, import_wait, run_original, run_transformed, transform};
use resumable::check::verify_function;
use resumable::driver::Config;
use resumable::interp::{Interpreter, Value};
use resumable::ir::builder::FunctionBuilder;
use resumable::ir::{
    BlockType, Catch, CompositeType, Expr, ExprKind, Field, FloatBinaryOp, FloatType, HeapType,
    IntBinaryOp, IntType, Module, NumType, RefType, Tag, ValType,
};
use test_case::test_case;

mod common;

/// `y = wait(x); return y + 1`
fn echo_plus_one(module: &mut Module) {
    let wait = import_wait(module);
    let mut b = FunctionBuilder::new("echo_plus_one", &[ValType::I32], &[ValType::I32]);
    let y = b.add_local("y", ValType::I32);
    let arg = b.get_local(0);
    let waited = b.suspending_call(wait, vec![arg]);
    let store = b.set_local(y, waited);
    let value = b.get_local(y);
    let one = b.i32_const(1);
    let sum = b.i32_add(value, one);
    let ret = b.ret(Some(sum));
    b.finish(module, vec![store, ret]);
}

/// `do { acc = acc + wait(n); n = n - 1 } while n; return acc`
fn countdown_sum(module: &mut Module) {
    let wait = import_wait(module);
    let mut b = FunctionBuilder::new("countdown_sum", &[ValType::I32], &[ValType::I32]);
    let acc = b.add_local("acc", ValType::I32);
    let repeat = b.loop_block(BlockType::empty(), |b, label| {
        let total = b.get_local(acc);
        let n = b.get_local(0);
        let waited = b.suspending_call(wait, vec![n]);
        let sum = b.i32_add(total, waited);
        let store = b.set_local(acc, sum);
        let n = b.get_local(0);
        let one = b.i32_const(1);
        let next = b.i32_sub(n, one);
        let step = b.set_local(0, next);
        let n = b.get_local(0);
        let again = b.branch_if(label, n, None);
        vec![store, step, again]
    });
    let total = b.get_local(acc);
    let ret = b.ret(Some(total));
    b.finish(module, vec![repeat, ret]);
}

/// `if c { y = wait(x) } else { y = x * 2 }; return y`
fn choose(module: &mut Module) {
    let wait = import_wait(module);
    let mut b = FunctionBuilder::new("choose", &[ValType::I32, ValType::I32], &[ValType::I32]);
    let y = b.add_local("y", ValType::I32);
    let condition = b.get_local(0);
    let branches = b.conditional(
        condition,
        BlockType::empty(),
        |b, _| {
            let x = b.get_local(1);
            let waited = b.suspending_call(wait, vec![x]);
            vec![b.set_local(y, waited)]
        },
        |b, _| {
            let x = b.get_local(1);
            let two = b.i32_const(2);
            let doubled = b.int_binary(IntType::I32, IntBinaryOp::Mul, x, two);
            vec![b.set_local(y, doubled)]
        },
    );
    let value = b.get_local(y);
    let ret = b.ret(Some(value));
    b.finish(module, vec![branches, ret]);
}

fn bail_tag(module: &mut Module) -> resumable::ir::TagIndex {
    module.add_tag(Tag {
        name: "bail".to_string(),
        params: vec![ValType::I32],
    })
}

/// `try { y = wait(x); throw bail(y + 10) } catch bail { payload }`
fn guarded_body(module: &mut Module) {
    let wait = import_wait(module);
    let bail = bail_tag(module);
    let mut b = FunctionBuilder::new("guarded_body", &[ValType::I32], &[ValType::I32]);
    let y = b.add_local("y", ValType::I32);
    let guarded = b.try_block(BlockType::single(ValType::I32), |b, _| {
        let x = b.get_local(0);
        let waited = b.suspending_call(wait, vec![x]);
        let store = b.set_local(y, waited);
        let value = b.get_local(y);
        let ten = b.i32_const(10);
        let payload = b.i32_add(value, ten);
        let thrown = b.throw(bail, vec![payload]);
        (vec![store, thrown], vec![Catch {
            tag: bail,
            body: Vec::new(),
        }])
    });
    b.finish(module, vec![guarded]);
}

/// `try { throw bail(x) } catch bail { wait(7); payload }`
fn guarded_handler(module: &mut Module) {
    let wait = import_wait(module);
    let bail = bail_tag(module);
    let mut b = FunctionBuilder::new("guarded_handler", &[ValType::I32], &[ValType::I32]);
    let guarded = b.try_block(BlockType::single(ValType::I32), |b, _| {
        let x = b.get_local(0);
        let thrown = b.throw(bail, vec![x]);
        let seven = b.i32_const(7);
        let waited = b.suspending_call(wait, vec![seven]);
        let dropped = b.drop_value(waited);
        (vec![thrown], vec![Catch {
            tag: bail,
            body: vec![dropped],
        }])
    });
    b.finish(module, vec![guarded]);
}

/// `return 100 + wait(x)`
fn live_operand(module: &mut Module) {
    let wait = import_wait(module);
    let mut b = FunctionBuilder::new("live_operand", &[ValType::I32], &[ValType::I32]);
    let hundred = b.i32_const(100);
    let x = b.get_local(0);
    let waited = b.suspending_call(wait, vec![x]);
    let sum = b.i32_add(hundred, waited);
    let ret = b.ret(Some(sum));
    b.finish(module, vec![ret]);
}

/// `inner(x) = wait(x) + 1; outer(x) = inner(x) * 2`
fn nested(module: &mut Module) {
    let wait = import_wait(module);
    let mut b = FunctionBuilder::new("inner", &[ValType::I32], &[ValType::I32]);
    let x = b.get_local(0);
    let waited = b.suspending_call(wait, vec![x]);
    let one = b.i32_const(1);
    let sum = b.i32_add(waited, one);
    let ret = b.ret(Some(sum));
    let inner = b.finish(module, vec![ret]);

    let mut b = FunctionBuilder::new("outer", &[ValType::I32], &[ValType::I32]);
    let x = b.get_local(0);
    let called = b.suspending_call(inner, vec![x]);
    let two = b.i32_const(2);
    let product = b.int_binary(IntType::I32, IntBinaryOp::Mul, called, two);
    let ret = b.ret(Some(product));
    b.finish(module, vec![ret]);
}

/// `return table[0](x)`
fn indirect(module: &mut Module) {
    let wait = import_wait(module);
    module.table.push(wait);
    let signature = module.intern_signature(vec![ValType::I32], vec![ValType::I32]);
    let mut b = FunctionBuilder::new("indirect", &[ValType::I32], &[ValType::I32]);
    let x = b.get_local(0);
    let slot = b.i32_const(0);
    let called = b.call_indirect(signature, vec![x], slot, true);
    let ret = b.ret(Some(called));
    b.finish(module, vec![ret]);
}

/// `return (ref wait)(x)`
fn by_reference(module: &mut Module) {
    let wait = import_wait(module);
    let signature = module.intern_signature(vec![ValType::I32], vec![ValType::I32]);
    let mut b = FunctionBuilder::new("by_reference", &[ValType::I32], &[ValType::I32]);
    let x = b.get_local(0);
    let callee = b.expr(ExprKind::FunctionReference(wait));
    let called = b.call_reference(signature, vec![x], callee, true);
    let ret = b.ret(Some(called));
    b.finish(module, vec![ret]);
}

/// `p = Point { x: v }; wait(0); return p.x`
fn struct_local(module: &mut Module) {
    let wait = import_wait(module);
    let point = module.add_composite(CompositeType::Struct {
        name: "Point".to_string(),
        fields: vec![Field {
            name: Some("x".to_string()),
            ty: ValType::I32,
            mutable: true,
        }],
    });
    let mut b = FunctionBuilder::new("struct_local", &[ValType::I32], &[ValType::I32]);
    let p = b.add_local(
        "p",
        ValType::Ref(RefType::nullable(HeapType::Struct(point))),
    );
    let v = b.get_local(0);
    let created = b.expr(ExprKind::StructNew {
        ty: point,
        fields: vec![v],
    });
    let store = b.set_local(p, created);
    let zero = b.i32_const(0);
    let waited = b.suspending_call(wait, vec![zero]);
    let dropped = b.drop_value(waited);
    let instance = b.get_local(p);
    let field = b.expr(ExprKind::StructGet {
        ty: point,
        field: 0,
        instance: Box::new(instance),
    });
    let ret = b.ret(Some(field));
    b.finish(module, vec![store, dropped, ret]);
}

/// `do { if n & 1 { acc = acc + wait(n) } else { acc = acc + 100 }; n = n - 1 } while n`
fn odd_waits(module: &mut Module) {
    let wait = import_wait(module);
    let mut b = FunctionBuilder::new("odd_waits", &[ValType::I32], &[ValType::I32]);
    let acc = b.add_local("acc", ValType::I32);
    let repeat = b.loop_block(BlockType::empty(), |b, label| {
        let n = b.get_local(0);
        let one = b.i32_const(1);
        let odd = b.int_binary(IntType::I32, IntBinaryOp::And, n, one);
        let branches = b.conditional(
            odd,
            BlockType::empty(),
            |b, _| {
                let total = b.get_local(acc);
                let n = b.get_local(0);
                let waited = b.suspending_call(wait, vec![n]);
                let sum = b.i32_add(total, waited);
                vec![b.set_local(acc, sum)]
            },
            |b, _| {
                let total = b.get_local(acc);
                let hundred = b.i32_const(100);
                let sum = b.i32_add(total, hundred);
                vec![b.set_local(acc, sum)]
            },
        );
        let n = b.get_local(0);
        let one = b.i32_const(1);
        let next = b.i32_sub(n, one);
        let step = b.set_local(0, next);
        let n = b.get_local(0);
        let again = b.branch_if(label, n, None);
        vec![branches, step, again]
    });
    let total = b.get_local(acc);
    let ret = b.ret(Some(total));
    b.finish(module, vec![repeat, ret]);
}

/// `do { j = 2; do { acc = acc + wait(n * j); j = j - 1 } while j; n = n - 1 } while n`
fn nested_loops(module: &mut Module) {
    let wait = import_wait(module);
    let mut b = FunctionBuilder::new("nested_loops", &[ValType::I32], &[ValType::I32]);
    let j = b.add_local("j", ValType::I32);
    let acc = b.add_local("acc", ValType::I32);
    let rows = b.loop_block(BlockType::empty(), |b, rows| {
        let two = b.i32_const(2);
        let reset = b.set_local(j, two);
        let columns = b.loop_block(BlockType::empty(), |b, columns| {
            let total = b.get_local(acc);
            let n = b.get_local(0);
            let column = b.get_local(j);
            let product = b.int_binary(IntType::I32, IntBinaryOp::Mul, n, column);
            let waited = b.suspending_call(wait, vec![product]);
            let sum = b.i32_add(total, waited);
            let store = b.set_local(acc, sum);
            let column = b.get_local(j);
            let one = b.i32_const(1);
            let next = b.i32_sub(column, one);
            let step = b.set_local(j, next);
            let column = b.get_local(j);
            let again = b.branch_if(columns, column, None);
            vec![store, step, again]
        });
        let n = b.get_local(0);
        let one = b.i32_const(1);
        let next = b.i32_sub(n, one);
        let step = b.set_local(0, next);
        let n = b.get_local(0);
        let again = b.branch_if(rows, n, None);
        vec![reset, columns, step, again]
    });
    let total = b.get_local(acc);
    let ret = b.ret(Some(total));
    b.finish(module, vec![rows, ret]);
}

/// `switch x { 0 => acc = wait(10), 1 => acc = wait(20), _ => acc = 30 }; return acc`
fn switch_cases(module: &mut Module) {
    let wait = import_wait(module);
    let mut b = FunctionBuilder::new("switch_cases", &[ValType::I32], &[ValType::I32]);
    let acc = b.add_local("acc", ValType::I32);
    let cases = b.block(BlockType::empty(), |b, end| {
        let fallback = b.block(BlockType::empty(), |b, otherwise| {
            let second = b.block(BlockType::empty(), |b, case_one| {
                let dispatch = b.block(BlockType::empty(), |b, case_zero| {
                    let selector = b.get_local(0);
                    vec![b.switch(selector, vec![case_zero, case_one], otherwise)]
                });
                let ten = b.i32_const(10);
                let waited = b.suspending_call(wait, vec![ten]);
                let store = b.set_local(acc, waited);
                vec![dispatch, store, b.break_to(end, None)]
            });
            let twenty = b.i32_const(20);
            let waited = b.suspending_call(wait, vec![twenty]);
            let store = b.set_local(acc, waited);
            vec![second, store, b.break_to(end, None)]
        });
        let thirty = b.i32_const(30);
        vec![fallback, b.set_local(acc, thirty)]
    });
    let total = b.get_local(acc);
    let ret = b.ret(Some(total));
    b.finish(module, vec![cases, ret]);
}

/// `return x + (if c { wait(x) } else { 7 })`
fn conditional_result(module: &mut Module) {
    let wait = import_wait(module);
    let mut b = FunctionBuilder::new(
        "conditional_result",
        &[ValType::I32, ValType::I32],
        &[ValType::I32],
    );
    let x = b.get_local(1);
    let condition = b.get_local(0);
    let picked = b.conditional(
        condition,
        BlockType::single(ValType::I32),
        |b, _| {
            let x = b.get_local(1);
            vec![b.suspending_call(wait, vec![x])]
        },
        |b, _| vec![b.i32_const(7)],
    );
    let sum = b.i32_add(x, picked);
    let ret = b.ret(Some(sum));
    b.finish(module, vec![ret]);
}

fn convert(b: &mut FunctionBuilder, from: NumType, to: NumType, operand: Expr) -> Expr {
    b.expr(ExprKind::Conversion {
        from,
        to,
        signed: true,
        operand: Box::new(operand),
    })
}

/// ```text
/// big = i64(x) * 2; ratio = f64(x) * 0.5; scale = 3.0
/// total = 1000 + i64(wait(x))
/// return i32(total + big) + i32(ratio) + i32(scale)
/// ```
fn wide_values(module: &mut Module) {
    let wait = import_wait(module);
    let mut b = FunctionBuilder::new("wide_values", &[ValType::I32], &[ValType::I32]);
    let big = b.add_local("big", ValType::I64);
    let ratio = b.add_local("ratio", ValType::F64);
    let scale = b.add_local("scale", ValType::F32);

    let x = b.get_local(0);
    let widened = convert(&mut b, NumType::I32, NumType::I64, x);
    let two = b.i64_const(2);
    let doubled = b.int_binary(IntType::I64, IntBinaryOp::Mul, widened, two);
    let store_big = b.set_local(big, doubled);
    let x = b.get_local(0);
    let x = convert(&mut b, NumType::I32, NumType::F64, x);
    let half = b.f64_const(0.5);
    let halved = b.expr(ExprKind::FloatBinary {
        ty: FloatType::F64,
        op: FloatBinaryOp::Mul,
        first: Box::new(x),
        second: Box::new(half),
    });
    let store_ratio = b.set_local(ratio, halved);
    let three = b.f32_const(3.0);
    let store_scale = b.set_local(scale, three);

    let thousand = b.i64_const(1000);
    let x = b.get_local(0);
    let waited = b.suspending_call(wait, vec![x]);
    let waited = convert(&mut b, NumType::I32, NumType::I64, waited);
    let total = b.int_binary(IntType::I64, IntBinaryOp::Add, thousand, waited);
    let big_value = b.get_local(big);
    let sum = b.int_binary(IntType::I64, IntBinaryOp::Add, total, big_value);
    let narrowed = convert(&mut b, NumType::I64, NumType::I32, sum);
    let ratio_value = b.get_local(ratio);
    let ratio_value = convert(&mut b, NumType::F64, NumType::I32, ratio_value);
    let scale_value = b.get_local(scale);
    let scale_value = convert(&mut b, NumType::F32, NumType::I32, scale_value);
    let partial = b.i32_add(narrowed, ratio_value);
    let result = b.i32_add(partial, scale_value);
    let ret = b.ret(Some(result));
    b.finish(module, vec![store_big, store_ratio, store_scale, ret]);
}

#[test_case(echo_plus_one, "echo_plus_one", &[41], 42, 1 ; "assignment")]
#[test_case(countdown_sum, "countdown_sum", &[3], 6, 3 ; "loop")]
#[test_case(choose, "choose", &[1, 5], 5, 1 ; "taken arm suspends")]
#[test_case(choose, "choose", &[0, 5], 10, 0 ; "other arm runs")]
#[test_case(guarded_body, "guarded_body", &[4], 14, 1 ; "try body")]
#[test_case(guarded_handler, "guarded_handler", &[9], 9, 1 ; "catch handler")]
#[test_case(live_operand, "live_operand", &[5], 105, 1 ; "live operand")]
#[test_case(nested, "outer", &[4], 10, 1 ; "nested coroutines")]
#[test_case(indirect, "indirect", &[8], 8, 1 ; "indirect call")]
#[test_case(by_reference, "by_reference", &[6], 6, 1 ; "reference call")]
#[test_case(struct_local, "struct_local", &[12], 12, 1 ; "reference local")]
#[test_case(odd_waits, "odd_waits", &[5], 209, 3 ; "conditional in loop")]
#[test_case(nested_loops, "nested_loops", &[2], 9, 4 ; "loop in loop")]
#[test_case(switch_cases, "switch_cases", &[0], 10, 1 ; "first case")]
#[test_case(switch_cases, "switch_cases", &[1], 20, 1 ; "second case")]
#[test_case(switch_cases, "switch_cases", &[7], 30, 0 ; "default case")]
#[test_case(conditional_result, "conditional_result", &[1, 5], 10, 1 ; "conditional result suspends")]
#[test_case(conditional_result, "conditional_result", &[0, 5], 12, 0 ; "conditional result")]
#[test_case(wide_values, "wide_values", &[4], 1017, 1 ; "wide values")]
fn transformed_matches_original(
    build: fn(&mut Module),
    name: &str,
    args: &[i32],
    expected: i32,
    suspensions: usize,
) {
    let mut module = Module::new();
    build(&mut module);
    let args: Vec<Value> = args.iter().copied().map(Value::I32).collect();
    assert_eq!(run_original(&module, name, &args), vec![Value::I32(expected)]);

    let summaries = transform(&mut module);
    assert!(!summaries.is_empty());
    for summary in &summaries {
        let function = module.find_function(&summary.function).unwrap();
        verify_function(&module, function).unwrap();
    }

    let (results, suspended, calls) = run_transformed(&module, name, &args);
    assert_eq!(results, vec![Value::I32(expected)]);
    assert_eq!(suspended, suspensions);
    // Calls replayed on resume are not recorded twice.
    assert_eq!(calls.len(), suspensions);
}

#[test]
fn first_run_saves_the_frame() {
    let mut module = Module::new();
    echo_plus_one(&mut module);
    transform(&mut module);
    let function = module.find_function("echo_plus_one").unwrap();
    let mut interpreter = Interpreter::new(&module, echo_host(&Config::default()));

    let placeholder = interpreter.invoke(function, &[Value::I32(41)]).unwrap();
    assert_eq!(placeholder, vec![Value::I32(0)]);
    let fiber = &interpreter.host().fiber;
    assert!(fiber.suspending);
    // x, y, then the resume state of the call.
    assert_eq!(fiber.values, vec![Value::I32(41), Value::I32(0), Value::I32(1)]);

    let fiber = &mut interpreter.host_mut().fiber;
    fiber.suspending = false;
    fiber.resuming = true;
    let resumed = interpreter.invoke(function, &[Value::I32(0)]).unwrap();
    assert_eq!(resumed, vec![Value::I32(42)]);
    let fiber = &interpreter.host().fiber;
    assert!(fiber.values.is_empty());
    assert!(!fiber.resuming && !fiber.suspending);
    assert_eq!(interpreter.host().calls(), &[(
        WAIT.to_string(),
        vec![Value::I32(41)]
    )]);
}

#[test]
fn each_scope_gets_a_dispatch_table() {
    let mut module = Module::new();
    countdown_sum(&mut module);
    let summaries = transform(&mut module);
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.function, "countdown_sum");
    // Fresh start of the body, fresh start of the loop and the call.
    assert_eq!(summary.resume_states, 3);
    let tables = &summary.dispatch_tables;
    assert_eq!(tables.len(), 2);
    assert_eq!((tables[0].base, tables[0].targets.len()), (0, 3));
    assert_eq!((tables[1].base, tables[1].targets.len()), (1, 2));
    // Resuming into the loop goes through the same block in the outer table.
    assert_eq!(tables[0].targets[1], tables[0].targets[2]);
    assert_ne!(tables[0].switch, tables[1].switch);
}

#[test_case(odd_waits, 3, &[(0, 3), (1, 2)] ; "conditional in loop")]
#[test_case(nested_loops, 4, &[(0, 4), (1, 3), (2, 2)] ; "loop in loop")]
fn nested_tables_enter_through_one_block(
    build: fn(&mut Module),
    states: u32,
    shape: &[(i32, usize)],
) {
    let mut module = Module::new();
    build(&mut module);
    let summaries = transform(&mut module);
    let summary = &summaries[0];
    assert_eq!(summary.resume_states, states);
    let tables = &summary.dispatch_tables;
    let found: Vec<_> = tables
        .iter()
        .map(|table| (table.base, table.targets.len()))
        .collect();
    assert_eq!(found, shape);

    for pair in tables.windows(2) {
        let (outer, inner) = (&pair[0], &pair[1]);
        // Every state from the nested table's base on goes through its jump-inside block.
        let first = usize::try_from(inner.base - outer.base).unwrap();
        let entries = &outer.targets[first..];
        assert_eq!(entries.len() as u32, states - inner.base as u32);
        assert!(entries.iter().all(|target| *target == entries[0]));
        assert_ne!(entries[0], outer.targets[0]);
    }
}

#[test]
fn wide_values_are_saved_with_their_types() {
    let mut module = Module::new();
    wide_values(&mut module);
    transform(&mut module);
    let function = module.find_function("wide_values").unwrap();
    let mut interpreter = Interpreter::new(&module, echo_host(&Config::default()));

    interpreter.invoke(function, &[Value::I32(4)]).unwrap();
    // The live operand, x, big, ratio, scale and the resume state.
    assert_eq!(interpreter.host().fiber.values, vec![
        Value::I64(1000),
        Value::I32(4),
        Value::I64(8),
        Value::F64(2.0),
        Value::F32(3.0),
        Value::I32(1),
    ]);
}

#[test]
fn dispatch_operands_survive_suspension() {
    let mut module = Module::new();
    indirect(&mut module);
    transform(&mut module);
    let function = module.find_function("indirect").unwrap();
    let mut interpreter = Interpreter::new(&module, echo_host(&Config::default()));

    interpreter.invoke(function, &[Value::I32(8)]).unwrap();
    // The table slot is saved below the frame.
    let values = &interpreter.host().fiber.values;
    assert_eq!(values.first(), Some(&Value::I32(0)));
    assert_eq!(values.len(), 3);
}

#[test]
fn functions_without_suspension_points_are_left_alone() {
    let mut module = Module::new();
    let mut b = FunctionBuilder::new("plain", &[ValType::I32], &[ValType::I32]);
    let x = b.get_local(0);
    let one = b.i32_const(1);
    let sum = b.i32_add(x, one);
    let function = b.finish(&mut module, vec![sum]);
    let before = module.function(function).body.clone().unwrap();

    assert!(transform(&mut module).is_empty());
    let after = module.function(function).body.as_ref().unwrap();
    assert_eq!(after.exprs, before.exprs);
    assert_eq!(after.locals, before.locals);
    assert!(module.find_function("fiber.current").is_none());
}

#[test]
fn runtime_functions_are_imported_once() {
    let mut module = Module::new();
    nested(&mut module);
    let summaries = transform(&mut module);
    let names: Vec<_> = summaries.iter().map(|s| s.function.as_str()).collect();
    assert_eq!(names, vec!["inner", "outer"]);

    let imports: Vec<_> = module
        .functions
        .iter()
        .filter(|(_, function)| function.name == "fiber.isSuspending")
        .collect();
    assert_eq!(imports.len(), 1);
    assert!(module.find_composite("Fiber").is_some());
}
