use crate::common::{WAIT, import_wait, init_tracing};
use resumable::driver::{Config, transform_module};
use resumable::interp::{FiberHost, Interpreter, Value, suspending};
use resumable::ir::builder::FunctionBuilder;
use resumable::ir::{Module, ValType};

mod common;

const RENAMED: &str = r#"
[transform]
verify = true

[runtime]
fiber_type = "Coroutine"
current = "co.current"
is_resuming = "co.resuming"
is_suspending = "co.suspending"
push_int = "co.save_i32"
pop_int = "co.load_i32"
"#;

#[test]
fn config_is_read_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Resumable.toml");
    std::fs::write(&path, RENAMED).unwrap();

    let config = Config::from_path(&path).unwrap();
    assert!(config.transform.verify);
    assert_eq!(config.runtime.current, "co.current");
    assert_eq!(config.runtime.pop_long, "fiber.popLong");
}

#[test]
fn missing_config_names_the_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Missing.toml");
    let error = Config::from_path(&path).unwrap_err();
    assert!(error.to_string().contains("Missing.toml"));
}

#[test]
fn renamed_runtime_is_used_end_to_end() {
    init_tracing();
    let config: Config = RENAMED.parse().unwrap();
    let mut module = Module::new();
    let wait = import_wait(&mut module);
    let mut b = FunctionBuilder::new("double_wait", &[ValType::I32], &[ValType::I32]);
    let x = b.get_local(0);
    let first = b.suspending_call(wait, vec![x]);
    let second = b.suspending_call(wait, vec![first]);
    let ret = b.ret(Some(second));
    let function = b.finish(&mut module, vec![ret]);

    let summaries = transform_module(&mut module, &config).unwrap();
    assert_eq!(summaries[0].resume_states, 3);
    assert!(module.find_function("co.current").is_some());
    assert!(module.find_function("co.save_i32").is_some());
    assert!(module.find_function("fiber.current").is_none());
    assert!(module.find_composite("Coroutine").is_some());

    let mut host = FiberHost::new(config.runtime.clone());
    host.register(WAIT, suspending(|args| args.to_vec(), vec![Value::I32(0)]));
    let mut interpreter = Interpreter::new(&module, host);
    let (results, suspensions) = interpreter
        .run_to_completion(function, &[Value::I32(21)])
        .unwrap();
    assert_eq!(results, vec![Value::I32(21)]);
    assert_eq!(suspensions, 2);
}
