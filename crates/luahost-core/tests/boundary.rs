use std::cell::Cell;
use std::rc::Rc;

use luahost_core::{
    host_fn, Allocator, BridgeError, CallArgs, CallContext, ForeignValue, HostObject, Library,
    Result, SourceLocation, State, StateRegistry, TypeTag,
};

fn sandbox() -> State {
    let state = State::new(None).expect("state");
    for lib in [Library::Base, Library::String, Library::Table, Library::Math] {
        state.install(lib).expect("install");
    }
    state
}

fn add(_: &CallContext<'_>, args: CallArgs) -> Result<Vec<ForeignValue>> {
    Ok(vec![(args.integer(1)? + args.integer(2)?).into()])
}

#[test]
fn guest_calls_host_callbacks() {
    let state = sandbox();
    state.register("add", add).expect("register");
    let out = state.do_string("return add(2, 3)", "main").expect("run");
    assert_eq!(out, vec![ForeignValue::Integer(5)]);
}

#[test]
fn bad_arguments_surface_as_typed_errors() {
    let state = sandbox();
    state.register("add", add).expect("register");
    let err = state.do_string("return add(2, 'x')", "main").expect_err("bad arg");
    assert!(
        matches!(err, BridgeError::BadArgument { position: 2, .. }),
        "{err:?}"
    );
}

#[test]
fn unregistered_callbacks_fail_cleanly() {
    let state = sandbox();
    let id = state.register_callback(add);
    let proxy = state.push_callable(id).expect("proxy");
    state.lua().globals().set("f", proxy).expect("set");
    assert!(state.unregister_callback(id));

    let err = state.do_string("return f(1, 2)", "main").expect_err("stale");
    assert!(matches!(err, BridgeError::UnresolvedCallback(stale) if stale == id));

    // an ordinary guest error, so pcall may catch it
    let out = state
        .do_string("return (pcall(f, 1, 2))", "main")
        .expect("pcall");
    assert_eq!(out, vec![ForeignValue::Boolean(false)]);
}

#[test]
fn ids_never_resolve_in_another_state() {
    let first = sandbox();
    let id = first.register_callback(add);
    first.close();

    let second = sandbox();
    let _own = second.register_callback(add);
    assert!(matches!(
        second.push_callable(id),
        Err(BridgeError::UnresolvedCallback(_))
    ));
}

#[test]
fn proxies_wrap_into_real_functions() {
    let state = sandbox();
    let id = state.register_callback(add);
    let proxy = state.push_callable(id).expect("proxy");
    let f = state.push_callback(&proxy).expect("wrap");
    state.lua().globals().set("proxy", proxy).expect("set");
    state.lua().globals().set("wrapped", f).expect("set");

    let out = state
        .do_string("return type(proxy), type(wrapped), wrapped(20, 22)", "main")
        .expect("run");
    assert_eq!(
        out,
        vec!["userdata".into(), "function".into(), ForeignValue::Integer(42)]
    );
}

#[test]
fn execution_limit_is_deterministic() {
    let state = sandbox();
    state.set_execution_limit(10_000);
    assert_eq!(state.execution_limit(), Some(10_000));

    for _ in 0..2 {
        let err = state.do_string("while true do end", "spin").expect_err("limit");
        assert!(matches!(err, BridgeError::LimitExceeded { limit: 10_000 }));
    }
    // each top-level call gets the full budget again
    for _ in 0..5 {
        state
            .do_string("for i = 1, 1000 do end", "short")
            .expect("within budget");
    }

    state.set_execution_limit(0);
    assert_eq!(state.execution_limit(), None);
    state
        .do_string("for i = 1, 100000 do end", "long")
        .expect("unlimited");
}

#[test]
fn hidden_pcall_cannot_swallow_the_limit() {
    let state = sandbox();
    state.hide_pcall().expect("hide");
    state.set_execution_limit(5_000);

    let err = state
        .do_string(
            "pcall(function() while true do end end) return 'escaped'",
            "escape",
        )
        .expect_err("limit must escape pcall");
    assert!(matches!(err, BridgeError::LimitExceeded { .. }));

    let out = state
        .do_string("return pcall(error, 'ordinary')", "ordinary")
        .expect("ordinary errors are still caught");
    assert_eq!(out[0], ForeignValue::Boolean(false));

    let out = state
        .do_string("return type(unsafe_pcall)", "raw")
        .expect("run");
    assert_eq!(out, vec!["function".into()]);
}

#[test]
fn raw_pcall_in_a_loop_cannot_outlast_the_limit() {
    let state = sandbox();
    state.set_execution_limit(10_000);

    let err = state
        .do_string(
            r#"
            local n = 0
            while n < 200000 do
                n = n + 1
                pcall(function() while true do end end)
            end
            return n
            "#,
            "retry",
        )
        .expect_err("the loop must not finish");
    assert!(matches!(err, BridgeError::LimitExceeded { limit: 10_000 }), "{err:?}");

    // the next call starts over with a full budget
    let out = state.do_string("return 1 + 1", "after").expect("run");
    assert_eq!(out, vec![ForeignValue::Integer(2)]);
}

#[test]
fn coroutines_run_under_the_limit() {
    let state = sandbox();
    state.install_coroutine().expect("coroutine");
    state.set_execution_limit(10_000);

    let wrapped = state.do_string(
        "return coroutine.wrap(function() for i = 1, 50000000 do end return 'finished' end)()",
        "wrap",
    );
    assert!(
        matches!(wrapped, Err(BridgeError::LimitExceeded { limit: 10_000 })),
        "{wrapped:?}"
    );

    let resumed = state.do_string(
        r#"
        local co = coroutine.create(function() while true do end end)
        while true do coroutine.resume(co) end
        "#,
        "resume",
    );
    assert!(
        matches!(resumed, Err(BridgeError::LimitExceeded { .. })),
        "{resumed:?}"
    );
}

#[test]
fn coroutines_within_budget_still_yield() {
    let state = sandbox();
    state.install_coroutine().expect("coroutine");
    state.set_execution_limit(1_000_000);

    let out = state
        .do_string(
            r#"
            local gen = coroutine.wrap(function()
                for i = 1, 100 do coroutine.yield(i) end
            end)
            local sum = 0
            for _ = 1, 100 do sum = sum + gen() end
            local co = coroutine.create(function(a) local b = coroutine.yield(a + 1) return b * 2 end)
            local _, first = coroutine.resume(co, 1)
            local _, second = coroutine.resume(co, 10)
            return sum, first, second, coroutine.status(co)
            "#,
            "gen",
        )
        .expect("run");
    assert_eq!(
        out,
        vec![
            ForeignValue::Integer(5050),
            ForeignValue::Integer(2),
            ForeignValue::Integer(20),
            "dead".into()
        ]
    );
}

#[test]
fn host_panics_are_contained_and_uncatchable() {
    let state = sandbox();
    state.hide_pcall().expect("hide");
    state
        .register("explode", |_, _| -> Result<Vec<ForeignValue>> {
            panic!("kaboom")
        })
        .expect("register");

    let err = state
        .do_string("pcall(explode) return 'swallowed'", "main")
        .expect_err("host panic escapes");
    assert!(matches!(err, BridgeError::HostPanic(ref msg) if msg == "kaboom"), "{err:?}");

    // the state is still usable
    let out = state.do_string("return 1 + 1", "after").expect("run");
    assert_eq!(out, vec![ForeignValue::Integer(2)]);
}

#[test]
fn panic_handler_runs_exactly_once() {
    let state = sandbox();
    let calls = Rc::new(Cell::new(0));
    let seen = calls.clone();
    let handler = state.register_callback(move |_, args| {
        seen.set(seen.get() + 1);
        let msg = args.get(1).and_then(|v| v.as_str()).unwrap_or_default();
        Ok(vec![format!("handled: {msg}").into()])
    });
    assert_eq!(state.install_panic_handler(Some(handler)).expect("install"), None);

    let err = state.do_string("error('bad')", "main").expect_err("panic");
    let panic = err.as_panic().expect("guest panic");
    assert!(panic.handled);
    assert_eq!(panic.message, "bad");
    assert_eq!(panic.payload, ForeignValue::from("handled: bad"));
    assert_eq!(calls.get(), 1);

    // not a panic: the handler stays out of it
    state.set_execution_limit(1_000);
    let _ = state.do_string("while true do end", "spin");
    assert!(state.load_chunk(b"return +", "broken").is_err());
    assert_eq!(calls.get(), 1);
}

#[test]
fn panic_handler_runs_once_through_nested_calls() {
    let state = sandbox();
    let calls = Rc::new(Cell::new(0));
    let seen = calls.clone();
    let handler = state.register_callback(move |_, _| {
        seen.set(seen.get() + 1);
        Ok(Vec::new())
    });
    state.install_panic_handler(Some(handler)).expect("install");
    state
        .register("relay", |ctx, _| ctx.call_global("explode", Vec::new()))
        .expect("register");

    let err = state
        .do_string("function explode() error('deep') end return relay()", "main")
        .expect_err("panic");
    let panic = err.as_panic().expect("guest panic");
    assert_eq!(panic.message, "deep");
    assert_eq!(panic.payload, ForeignValue::None);
    assert_eq!(calls.get(), 1);
}

#[test]
fn default_payload_is_the_message() {
    let state = sandbox();
    let err = state
        .do_string("local x = 1\nerror('oops')", "named.lua")
        .expect_err("panic");
    let panic = err.as_panic().expect("guest panic");
    assert!(!panic.handled);
    assert_eq!(panic.payload, ForeignValue::Error("oops".into()));
    assert_eq!(
        panic.location,
        Some(SourceLocation {
            chunk: "named.lua".into(),
            line: 2
        })
    );
}

#[test]
fn table_errors_reach_the_handler_as_tables() {
    let state = sandbox();
    let seen = Rc::new(Cell::new(None));
    let sink = seen.clone();
    let handler = state.register_callback(move |_, args| {
        sink.set(args.get(1).map(|v| v.tag()));
        Ok(vec![args.get(1).cloned().unwrap_or_default()])
    });
    state.install_panic_handler(Some(handler)).expect("install");

    let err = state
        .do_string("error({ code = 42 })", "main")
        .expect_err("panic");
    let panic = err.as_panic().expect("guest panic");
    assert_eq!(seen.take(), Some(TypeTag::Table));
    assert_eq!(
        panic.payload,
        ForeignValue::Table(vec![("code".into(), ForeignValue::Integer(42))])
    );
    assert_eq!(panic.message, "(error object is a table value)");
}

#[test]
fn table_errors_are_the_default_payload() {
    let state = sandbox();
    state
        .register("relay", |ctx, _| ctx.call_global("explode", Vec::new()))
        .expect("register");
    let err = state
        .do_string(
            r#"
            local E = setmetatable({ code = 7 }, { __tostring = function(e) return "E" .. e.code end })
            function explode() error(E) end
            relay()
            "#,
            "main",
        )
        .expect_err("panic");
    let panic = err.as_panic().expect("guest panic");
    assert!(!panic.handled);
    assert_eq!(panic.message, "E7");
    assert_eq!(
        panic.payload,
        ForeignValue::Table(vec![("code".into(), ForeignValue::Integer(7))])
    );
}

#[test]
fn replacing_the_panic_handler_returns_the_old_one() {
    let state = sandbox();
    let a = state.register_callback(|_, _| Ok(Vec::new()));
    let b = state.register_callback(|_, _| Ok(Vec::new()));
    assert_eq!(state.install_panic_handler(Some(a)).expect("a"), None);
    assert_eq!(state.install_panic_handler(Some(b)).expect("b"), Some(a));
    assert_eq!(state.install_panic_handler(None).expect("clear"), Some(b));
}

#[test]
fn callbacks_reenter_the_guest() {
    let state = sandbox();
    state
        .register("twice", |ctx, args| {
            let f = match args.get(1) {
                Some(ForeignValue::Function(f)) => f.clone(),
                _ => return Err(BridgeError::bad_argument(1, "function expected")),
            };
            let x = args.integer(2)?;
            let once = ctx.call(&f, vec![x.into()])?;
            let n = once.first().and_then(ForeignValue::as_integer).unwrap_or(0);
            Ok(ctx.call(&f, vec![n.into()])?)
        })
        .expect("register");

    let out = state
        .do_string("return twice(function(x) return x * 3 end, 2)", "main")
        .expect("run");
    assert_eq!(out, vec![ForeignValue::Integer(18)]);
}

#[test]
fn callbacks_can_register_callbacks() {
    let state = sandbox();
    state
        .register("make_adder", |ctx, args| {
            let n = args.integer(1)?;
            let id = ctx.register_callback(move |_, args| Ok(vec![(args.integer(1)? + n).into()]));
            Ok(vec![id.into()])
        })
        .expect("register");

    let out = state
        .do_string("local add5 = make_adder(5) return add5(10)", "main")
        .expect("run");
    assert_eq!(out, vec![ForeignValue::Integer(15)]);
    assert_eq!(state.callback_count(), 2);
}

struct Counter {
    count: i64,
}

impl HostObject for Counter {
    fn type_name(&self) -> &str {
        "Counter"
    }

    fn get(&self, field: &str) -> Option<ForeignValue> {
        match field {
            "count" => Some(self.count.into()),
            _ => None,
        }
    }

    fn set(&mut self, field: &str, value: ForeignValue) -> Result<()> {
        match (field, value.as_integer()) {
            ("count", Some(n)) => {
                self.count = n;
                Ok(())
            }
            ("count", None) => Err(BridgeError::bad_argument(3, "integer expected")),
            _ => Err(BridgeError::NoSuchField {
                type_name: "Counter".into(),
                field: field.into(),
            }),
        }
    }

    fn methods(&self) -> &[&'static str] {
        &["incr"]
    }

    fn call(&mut self, _: &CallContext<'_>, method: &str, args: CallArgs) -> Result<Vec<ForeignValue>> {
        match method {
            "incr" => {
                self.count += args.opt_integer(1)?.unwrap_or(1);
                Ok(vec![self.count.into()])
            }
            _ => Err(BridgeError::NoSuchMethod {
                type_name: "Counter".into(),
                method: method.into(),
            }),
        }
    }
}

#[test]
fn struct_proxies_expose_fields_and_methods() {
    let state = sandbox();
    let id = state.register_struct(Counter { count: 1 });
    state.set_global("counter", id.into()).expect("set");

    let out = state
        .do_string(
            "counter:incr(2)\ncounter.count = counter.count * 10\nreturn counter.count, counter.missing",
            "main",
        )
        .expect("run");
    assert_eq!(out, vec![ForeignValue::Integer(30), ForeignValue::None]);

    let count = state.with_struct(id, |obj| obj.get("count")).expect("struct");
    assert_eq!(count, Some(ForeignValue::Integer(30)));

    let err = state
        .do_string("counter.nope = 1", "main")
        .expect_err("no field");
    assert!(matches!(err, BridgeError::NoSuchField { .. }));

    let proxy = state.push_struct(id).expect("proxy");
    assert_eq!(state.to_struct_id(&proxy).ok(), Some(id));
    state.lua().globals().set("again", proxy).expect("set");
    let out = state
        .do_string("return counter == again, tostring(counter)", "main")
        .expect("run");
    assert_eq!(out[0], ForeignValue::Boolean(true));
    assert_eq!(out[1], ForeignValue::from(id.to_string()));
}

struct Brittle;

impl HostObject for Brittle {
    fn type_name(&self) -> &str {
        "Brittle"
    }

    fn get(&self, field: &str) -> Option<ForeignValue> {
        panic!("cannot read {field}")
    }

    fn set(&mut self, field: &str, _: ForeignValue) -> Result<()> {
        panic!("cannot write {field}")
    }
}

#[test]
fn struct_accessor_panics_become_host_panics() {
    let state = sandbox();
    let id = state.register_struct(Brittle);
    state.set_global("brittle", id.into()).expect("set");

    let err = state.do_string("return brittle.x", "read").expect_err("get panics");
    assert!(matches!(err, BridgeError::HostPanic(ref msg) if msg == "cannot read x"), "{err:?}");
    let err = state.do_string("brittle.y = 1", "write").expect_err("set panics");
    assert!(matches!(err, BridgeError::HostPanic(ref msg) if msg == "cannot write y"), "{err:?}");

    let out = state.do_string("return 'still usable'", "after").expect("run");
    assert_eq!(out, vec!["still usable".into()]);
}

#[test]
fn unregistered_structs_stop_resolving() {
    let state = sandbox();
    let id = state.register_struct(Counter { count: 0 });
    state.set_global("counter", id.into()).expect("set");
    state.unregister_struct(id);
    let err = state
        .do_string("return counter.count", "main")
        .expect_err("stale");
    assert!(matches!(err, BridgeError::UnresolvedStruct(_)));
}

#[test]
fn states_run_independently_on_threads() {
    let handles: Vec<_> = (0..4)
        .map(|n: i64| {
            std::thread::spawn(move || {
                let state = sandbox();
                state.set_execution_limit(1_000_000);
                state.register("add", add).expect("register");
                let src = format!("local t = 0 for i = 1, 1000 do t = add(t, {n}) end return t");
                state.do_string(&src, "worker").expect("run")
            })
        })
        .collect();

    for (n, handle) in handles.into_iter().enumerate() {
        let out = handle.join().expect("thread");
        assert_eq!(out, vec![ForeignValue::Integer(1000 * n as i64)]);
    }
}

#[test]
fn chunks_dump_and_reload() {
    let state = sandbox();
    let chunk = state
        .load_chunk(b"local n = ... return n * 2", "double")
        .expect("load");
    assert_eq!(chunk.name(), "double");
    let bytes = state.dump_chunk(&chunk, true).expect("dump");

    let fresh = sandbox();
    let reloaded = fresh.load_chunk(&bytes, "double").expect("reload");
    let out = fresh
        .exec_chunk(&reloaded, vec![21_i64.into()])
        .expect("exec");
    assert_eq!(out, vec![ForeignValue::Integer(42)]);
}

#[test]
fn compile_errors_install_nothing() {
    let state = sandbox();
    let err = state
        .load_chunk(b"x = = 1", "broken")
        .expect_err("syntax");
    match err {
        BridgeError::Compile { chunk, .. } => assert_eq!(chunk, "broken"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(state.global("x").expect("global"), ForeignValue::None);
}

#[test]
fn guest_functions_are_callable_from_the_host() {
    let state = sandbox();
    let out = state
        .do_string("return function(x) return x * 3 end", "main")
        .expect("run");
    let ForeignValue::Function(f) = &out[0] else {
        panic!("expected a function, got {:?}", out[0]);
    };
    assert_eq!(
        state.call_function(f, vec![4_i64.into()]).expect("call"),
        vec![ForeignValue::Integer(12)]
    );
    assert!(!state.dump_function(f, false).expect("dump").is_empty());

    state
        .do_string("function mul(a, b) return a * b end", "defs")
        .expect("defs");
    assert_eq!(
        state
            .call_global("mul", vec![6_i64.into(), 7_i64.into()])
            .expect("call"),
        vec![ForeignValue::Integer(42)]
    );
    assert!(matches!(
        state.call_global("nope", Vec::new()),
        Err(BridgeError::NotCallable(_))
    ));
}

#[test]
fn tables_cross_the_boundary() {
    let state = sandbox();
    let cfg = ForeignValue::Table(vec![
        ("name".into(), "demo".into()),
        ("sizes".into(), ForeignValue::list(vec![1_i64.into(), 2_i64.into()])),
    ]);
    state.set_global("cfg", cfg).expect("set");
    let out = state
        .do_string("return cfg.name .. #cfg.sizes, { ok = true }", "main")
        .expect("run");
    assert_eq!(out[0], ForeignValue::from("demo2"));
    assert_eq!(out[1].field("ok"), Some(&ForeignValue::Boolean(true)));
}

#[test]
fn allocation_failures_leave_the_state_usable() {
    let state = State::new(Some(Allocator::limited(2 * 1024 * 1024))).expect("state");
    state.install_base().expect("base");
    state.install_string().expect("string");
    assert_eq!(state.allocator().max_bytes(), Some(2 * 1024 * 1024));

    let err = state
        .do_string("return string.rep('x', 16 * 1024 * 1024)", "big")
        .expect_err("too big");
    assert!(matches!(err, BridgeError::Allocation(_)), "{err:?}");

    let out = state.do_string("return 1 + 1", "small").expect("still usable");
    assert_eq!(out, vec![ForeignValue::Integer(2)]);
    assert!(state.used_memory() > 0);
}

#[test]
fn host_libraries_are_requireable() {
    let state = sandbox();
    state.install_package().expect("package");
    state
        .register_library(
            "greet",
            [(
                "hello",
                host_fn(|_, args| Ok(vec![format!("hello {}", args.string(1)?).into()])),
            )],
        )
        .expect("library");
    let out = state
        .do_string("return require('greet').hello('bob'), greet.hello(1)", "main")
        .expect("run");
    assert_eq!(out, vec!["hello bob".into(), "hello 1".into()]);
}

#[test]
fn bit32_is_available_on_request() {
    let state = sandbox();
    assert!(state.do_string("return bit32", "empty").expect("run")[0].is_none());
    state.install_bit32().expect("bit32");
    let out = state
        .do_string("return bit32.bxor(5, 3), bit32.extract(0xf0, 4, 4)", "main")
        .expect("run");
    assert_eq!(out, vec![ForeignValue::Integer(6), ForeignValue::Integer(15)]);
}

#[test]
fn files_run_with_their_name_and_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("job.lua");
    std::fs::write(&path, "#!/usr/bin/env lua\nreturn 7").expect("write");

    let state = sandbox();
    assert_eq!(state.do_file(&path).expect("run"), vec![ForeignValue::Integer(7)]);

    std::fs::write(&path, "#!/usr/bin/env lua\nerror('nope')").expect("write");
    let err = state.do_file(&path).expect_err("panic");
    let location = err.as_panic().and_then(|p| p.location.clone());
    assert_eq!(
        location,
        Some(SourceLocation {
            chunk: "job.lua".into(),
            line: 2
        })
    );

    assert!(matches!(
        state.do_file(dir.path().join("missing.lua")),
        Err(BridgeError::Io { .. })
    ));
}

#[test]
fn registry_manages_state_lifetimes() {
    let mut states = StateRegistry::new();
    let a = states.create(None).expect("a");
    let b = states.create(Some(Allocator::limited(8 * 1024 * 1024))).expect("b");
    states.set_execution_limit(a, 100).expect("limit");
    assert_eq!(states.get(a).expect("a").execution_limit(), Some(100));
    assert_eq!(states.get(b).expect("b").execution_limit(), None);

    states.destroy(a).expect("destroy");
    assert!(!states.contains(a));
    assert!(states.contains(b));
    assert!(matches!(states.destroy(a), Err(BridgeError::StaleState(_))));
    assert_eq!(states.len(), 1);
}

#[test]
fn reinstalling_restores_what_the_guest_removed() {
    let state = sandbox();
    state
        .do_string("print = nil string.rep = nil math = nil", "clobber")
        .expect("run");
    state.install_base().expect("base");
    state.install_string().expect("string");
    state.install_math().expect("math");
    let out = state
        .do_string("return type(print), string.rep('x', 3), math.max(1, 2)", "check")
        .expect("run");
    assert_eq!(
        out,
        vec!["function".into(), "xxx".into(), ForeignValue::Integer(2)]
    );
}

#[test]
fn guest_load_rejects_bytecode() {
    let state = sandbox();
    let err = state
        .do_string("return load(string.dump(function() return 7 end))()", "dump")
        .expect_err("bytecode refused");
    let panic = err.as_panic().expect("guest panic");
    assert!(panic.message.contains("attempt to call a nil value"), "{}", panic.message);

    let out = state
        .do_string(
            "local f, err = load(string.dump(function() return 7 end)) return f, err",
            "dump",
        )
        .expect("run");
    assert_eq!(out[0], ForeignValue::None);
    assert!(
        out[1].as_str().is_some_and(|m| m.contains("binary chunk")),
        "{:?}",
        out[1]
    );

    // the host keeps its own way in
    let chunk = state.load_chunk(b"return 7", "text").expect("compile");
    let bytes = state.dump_chunk(&chunk, false).expect("dump");
    let reloaded = state.load_chunk(&bytes, "binary").expect("host loads bytecode");
    assert_eq!(
        state.exec_chunk(&reloaded, Vec::new()).expect("run"),
        vec![ForeignValue::Integer(7)]
    );
}
