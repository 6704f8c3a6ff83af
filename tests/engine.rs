use std::fs;

use ember::{Arity, Engine, EngineConfig, EngineError, Key, Severity, Value, VmError};

fn engine() -> Engine {
    Engine::new(EngineConfig::default())
}

// --- Core scenarios ---

#[test]
fn addition_binds_global() {
    let run = engine().eval("$a = 1 + 2;").unwrap();
    assert_eq!(run.globals["a"], Value::from(3));
    assert!(run.diagnostics.is_empty());
}

#[test]
fn missing_index_is_a_notice_not_an_abort() {
    let run = engine().eval("$a = array(1,2,3); print $a[5]; print 'after';").unwrap();
    assert_eq!(run.output, "after");
    assert_eq!(run.diagnostics.len(), 1);
    assert_eq!(run.diagnostics[0].severity, Severity::Notice);
    assert_eq!(run.diagnostics[0].line, Some(1));
}

#[test]
fn concatenation_coerces_numbers() {
    assert_eq!(engine().eval("print \"abc\" . 5;").unwrap().output, "abc5");
}

#[test]
fn foreach_visits_in_insertion_order() {
    let run = engine()
        .eval("$seen = []; foreach(array(\"x\"=>1,\"y\"=>2) as $k=>$v) { $seen[] = $k; $seen[] = $v; }")
        .unwrap();
    let seen = run.globals["seen"].as_array().unwrap();
    let items: Vec<String> = seen.values().map(|v| v.to_str().to_string()).collect();
    assert_eq!(items, ["x", "1", "y", "2"]);
}

#[test]
fn recursion_below_and_above_the_ceiling() {
    let decl = "function f($n){ if($n<=0) return 0; return $n + f($n-1); }";
    let run = engine().eval(&format!("{decl} $s = f(200);")).unwrap();
    assert_eq!(run.globals["s"], Value::from(20100));

    let err = engine().eval(&format!("{decl} $s = f(1000000);")).unwrap_err();
    match err {
        EngineError::Runtime(VmError::RecursionLimit { limit, .. }) => assert_eq!(limit, 256),
        other => panic!("expected a recursion fatal, got {other:?}"),
    }
}

#[test]
fn ceiling_is_configurable() {
    let decl = "function f($n){ if($n<=0) return 0; return $n + f($n-1); }";
    let mut deep = Engine::new(EngineConfig { max_recursion_depth: 2000, ..EngineConfig::default() });
    let run = deep.eval(&format!("{decl} $s = f(1000);")).unwrap();
    assert_eq!(run.globals["s"], Value::from(500500));
}

// --- Properties ---

#[test]
fn arrays_copy_on_write() {
    let run = engine()
        .eval("$a = ['k' => [1, 2]]; $b = $a; $b['k'][] = 3; $b['new'] = true; function touch($x) { $x[] = 9; return $x; } $c = touch($a);")
        .unwrap();
    let a = run.globals["a"].as_array().unwrap();
    assert_eq!(a.len(), 1);
    assert_eq!(a.get(&Key::from("k")).unwrap(), &Value::from(vec![1, 2]));
    assert_eq!(run.globals["b"].as_array().unwrap().len(), 2);
    assert_eq!(run.globals["b"].as_array().unwrap().get(&Key::from("k")).unwrap(), &Value::from(vec![1, 2, 3]));
    assert_eq!(run.globals["c"].as_array().unwrap().len(), 2);
}

#[test]
fn compilation_is_deterministic() {
    let source = "function g($x) { switch ($x) { case 1: return 'a'; default: return 'b'; } }
        $m = ['z' => 1, 'a' => 2];
        foreach ($m as $k => $v) { print $k, g($v); }";
    let first = engine().compile(source).unwrap();
    let second = engine().compile(source).unwrap();
    assert_eq!(first.disassemble(), second.disassemble());
    let a = engine().run(first).unwrap();
    let b = engine().run(second).unwrap();
    assert_eq!(a.output, b.output);
    assert_eq!(a.output, "zaab");
}

#[test]
fn independent_engines_on_threads() {
    let handles: Vec<_> = (0..4)
        .map(|i| {
            std::thread::spawn(move || {
                let mut engine = Engine::new(EngineConfig::default());
                engine.set_global("i", i);
                let run = engine.eval("$t = 0; for ($j = 0; $j <= 100; $j++) { $t += $j * $i; } print $t;").unwrap();
                run.output
            })
        })
        .collect();
    let outputs: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(outputs, ["0", "5050", "10100", "15150"]);
}

#[test]
fn compile_errors_prevent_execution() {
    let mut engine = engine();
    let printed = std::rc::Rc::new(std::cell::Cell::new(false));
    let flag = std::rc::Rc::clone(&printed);
    engine.on_output(move |_| flag.set(true));
    let err = engine.eval("print 'never'; function f() {} function f() {}").unwrap_err();
    let EngineError::Compile(diagnostics) = err else {
        panic!("expected a compile error");
    };
    assert_eq!(diagnostics[0].code, Some("EMB-C003"));
    assert!(!printed.get());
}

#[test]
fn deep_nesting_is_a_compile_error() {
    let sources = [
        format!("$a = {}1{};", "(".repeat(10_000), ")".repeat(10_000)),
        format!("$a = {}1{};", "[".repeat(10_000), "]".repeat(10_000)),
        format!("$a = {}1;", "- ".repeat(10_000)),
        format!("$a = 1{};", " + 1".repeat(10_000)),
        format!("{}print 1;{}", "{".repeat(10_000), "}".repeat(10_000)),
    ];
    for source in &sources {
        let EngineError::Compile(diagnostics) = engine().eval(source).unwrap_err() else {
            panic!("expected a compile error");
        };
        assert_eq!(diagnostics[0].code, Some("EMB-P013"));
    }
    let moderate = format!("$a = {}1{};", "(".repeat(50), ")".repeat(50));
    assert_eq!(engine().eval(&moderate).unwrap().globals["a"], Value::from(1));
}

#[test]
fn anonymous_function_in_a_variable() {
    let mut engine = engine();
    let run = engine.eval("$f = function($x) { return $x * 2; }; print $f(3);").unwrap();
    assert_eq!(run.output, "6");
}

#[test]
fn warnings_still_run_to_completion() {
    let run = engine().eval("$x = 10 / 0; foreach (3 as $v) {} print undefined_fn(), 'done'; return 7;").unwrap();
    assert_eq!(run.output, "done");
    assert_eq!(run.result, Value::from(7));
    assert!(run.diagnostics.iter().all(|d| d.severity == Severity::Warning));
    assert_eq!(run.diagnostics.len(), 3);
}

#[test]
fn value_limit_models_out_of_memory() {
    let mut engine = Engine::new(EngineConfig { max_values: Some(8), ..EngineConfig::default() });
    let err = engine.eval("function f($n) { $a = $n; return f($n + 1); } f(0);").unwrap_err();
    assert!(matches!(err, EngineError::Runtime(VmError::OutOfMemory { .. })));
}

// --- Host interaction ---

#[test]
fn host_functions_see_extra_arguments() {
    let mut engine = engine();
    engine.register_function("func_num_args", Arity::Exact(0), |ctx, _| {
        let n = ctx.caller_args().len() as i64;
        ctx.set_result(Value::from(n));
    });
    engine.register_function("implode", Arity::Exact(2), |ctx, args| {
        let parts: Vec<String> = args[1]
            .as_array()
            .map(|m| m.values().map(|v| v.to_str().to_string()).collect())
            .unwrap_or_default();
        ctx.set_result(Value::from(parts.join(&args[0].to_str())));
    });
    let run = engine
        .eval("function v($a) { return func_num_args(); } print v(1, 2, 3), ':', implode('-', ['a', 'b', 'c']);")
        .unwrap();
    assert_eq!(run.output, "3:a-b-c");
}

#[test]
fn include_runs_in_the_including_scope() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("lib.emb"), "function twice($x) { return $x * 2; } $from_lib = $base + 1; return $from_lib;").unwrap();
    fs::write(dir.path().join("broken.emb"), "function (").unwrap();

    let mut engine = Engine::new(EngineConfig { include_paths: vec![dir.path().to_path_buf()], ..EngineConfig::default() });
    let run = engine
        .eval("function load($p) { $base = 40; return include $p; } $r = load('lib.emb'); print twice($r); $bad = include 'broken.emb'; $missing = include 'missing.emb';")
        .unwrap();
    assert_eq!(run.globals["r"], Value::from(41));
    assert_eq!(run.output, "82");
    assert!(!run.globals.contains_key("from_lib"));
    assert_eq!(run.globals["bad"], Value::from(false));
    assert_eq!(run.globals["missing"], Value::from(false));
    let warnings: Vec<_> = run.diagnostics.iter().filter(|d| d.code == Some("EMB-R207")).collect();
    assert_eq!(warnings.len(), 2);
}

#[test]
fn included_globals_land_in_global_scope() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("defs.emb");
    fs::write(&path, "$shared = 'from include';").unwrap();
    let run = engine().eval(&format!("include '{}'; print $shared;", path.display())).unwrap();
    assert_eq!(run.output, "from include");
}

#[test]
fn self_including_file_hits_the_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("again.emb"), "include 'again.emb';").unwrap();
    let mut engine = Engine::new(EngineConfig { include_paths: vec![dir.path().to_path_buf()], ..EngineConfig::default() });
    match engine.eval("include 'again.emb';") {
        Err(EngineError::Runtime(VmError::RecursionLimit { function, .. })) => assert_eq!(function, "include"),
        other => panic!("expected recursion fatal, got {other:?}"),
    }
}

#[test]
fn default_argument_that_includes_hits_the_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("again.emb"), "return g();").unwrap();
    let mut engine = Engine::new(EngineConfig { include_paths: vec![dir.path().to_path_buf()], ..EngineConfig::default() });
    let err = engine.eval("function g($v = include 'again.emb') { return $v; } g();").unwrap_err();
    assert!(matches!(err, EngineError::Runtime(VmError::RecursionLimit { limit: 256, .. })), "got {err:?}");
}

#[test]
fn diagnostic_consumer_sees_every_stage() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let mut engine = engine();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    engine.on_diagnostic(move |d| sink.borrow_mut().push((d.severity, d.code)));

    assert!(matches!(engine.eval("$a = ;"), Err(EngineError::Compile(_))));
    engine.eval("print $nope;").unwrap();
    assert!(engine.eval("function f() { return f(); } f();").is_err());

    let seen = seen.borrow();
    assert_eq!(seen.first().map(|(s, _)| *s), Some(Severity::Error));
    assert!(seen.contains(&(Severity::Notice, Some("EMB-R101"))));
    assert_eq!(seen.last(), Some(&(Severity::Fatal, Some("EMB-R001"))));
}
