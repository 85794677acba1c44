use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::Result;

use firewall::{
    cidr::compile,
    http::{Handler, Ident, Request, Response},
    middleware::{
        IdentFn, MaintenanceLimitOptions, MaintenanceThrottleOptions, with_maintenance,
        wrap_maintenance_limit, wrap_maintenance_throttle,
    },
};

fn ok(_: Request) -> Result<Response> {
    Ok(Response::plain(200, "ok"))
}

fn sleepy(duration: Duration) -> Arc<dyn Handler> {
    Arc::new(move |_: Request| -> Result<Response> {
        thread::sleep(duration);
        Ok(Response::plain(200, "ok"))
    })
}

/// Each test gets its own identity; the maintenance table is process-wide
/// and tests run in parallel.
fn ident(name: &'static str) -> (Ident, IdentFn) {
    (
        Ident::Text(name.to_string()),
        Arc::new(move |_| Ident::Text(name.to_string())),
    )
}

#[test]
fn test_operator_waits_for_drain_and_sheds_during_body() -> Result<()> {
    let (ident, ident_fn) = ident("drain-and-shed");

    let handler = wrap_maintenance_limit(
        sleepy(Duration::from_millis(800)),
        MaintenanceLimitOptions {
            ident_fn,
            max_wait: Duration::from_millis(100),
            ..Default::default()
        },
    );

    let started = Instant::now();

    // R1 is admitted and sleeps inside the inner handler.
    let first = {
        let handler = handler.clone();
        thread::spawn(move || handler.call(Request::new("10.0.0.1")))
    };
    thread::sleep(Duration::from_millis(100));

    // The operator must not start its body until R1 has returned.
    let operator = thread::spawn(move || {
        with_maintenance(ident, || {
            let entered = Instant::now();
            thread::sleep(Duration::from_millis(500));
            entered
        })
    });
    thread::sleep(Duration::from_millis(300));

    // R2 arrives mid-maintenance and is shed.
    assert_eq!(handler.call(Request::new("10.0.0.1"))?.status, 503);

    assert_eq!(first.join().unwrap()?.status, 200);

    let entered = operator.join().unwrap();
    assert!(entered.duration_since(started) >= Duration::from_millis(800));

    // Maintenance over; requests flow again.
    assert_eq!(handler.call(Request::new("10.0.0.1"))?.status, 200);

    Ok(())
}

#[test]
fn test_throttle_blocks_until_operator_exits() -> Result<()> {
    let (ident, ident_fn) = ident("throttle-blocks");

    let handler = wrap_maintenance_throttle(
        Arc::new(ok),
        MaintenanceThrottleOptions {
            ident_fn,
            ..Default::default()
        },
    );

    let operator = thread::spawn(move || {
        with_maintenance(ident, || thread::sleep(Duration::from_millis(400)))
    });
    thread::sleep(Duration::from_millis(100));

    // The request stalls at the gate for the rest of the maintenance.
    let started = Instant::now();
    assert_eq!(handler.call(Request::new("10.0.0.1"))?.status, 200);
    assert!(started.elapsed() >= Duration::from_millis(250));

    operator.join().unwrap();

    Ok(())
}

#[test]
fn test_bypass_list_skips_the_gate() -> Result<()> {
    let (ident, ident_fn) = ident("bypass");

    let handler = wrap_maintenance_limit(
        Arc::new(ok),
        MaintenanceLimitOptions {
            ident_fn,
            bypass_list: Arc::new(compile(["10.9.0.0/16"])),
            max_wait: Duration::from_millis(50),
            ..Default::default()
        },
    );

    let operator = thread::spawn(move || {
        with_maintenance(ident, || thread::sleep(Duration::from_millis(400)))
    });
    thread::sleep(Duration::from_millis(100));

    // Bypass-listed clients sail through mid-maintenance; others are shed.
    assert_eq!(handler.call(Request::new("10.9.1.2"))?.status, 200);
    assert_eq!(handler.call(Request::new("10.8.1.2"))?.status, 503);

    operator.join().unwrap();

    Ok(())
}

#[test]
fn test_identities_are_independent() -> Result<()> {
    let (_, other_fn) = ident("independent-b");
    let (ident, _) = ident("independent-a");

    let handler = wrap_maintenance_limit(
        Arc::new(ok),
        MaintenanceLimitOptions {
            ident_fn: other_fn,
            max_wait: Duration::from_millis(50),
            ..Default::default()
        },
    );

    let operator = thread::spawn(move || {
        with_maintenance(ident, || thread::sleep(Duration::from_millis(400)))
    });
    thread::sleep(Duration::from_millis(100));

    // Maintenance on one identity never touches another.
    assert_eq!(handler.call(Request::new("10.0.0.1"))?.status, 200);

    operator.join().unwrap();

    Ok(())
}

#[test]
fn test_nested_filters_enter_once() -> Result<()> {
    let (ident, ident_fn) = ident("nested");

    let inner = wrap_maintenance_throttle(
        Arc::new(ok),
        MaintenanceThrottleOptions {
            ident_fn: ident_fn.clone(),
            ..Default::default()
        },
    );
    let handler = wrap_maintenance_throttle(
        inner,
        MaintenanceThrottleOptions {
            ident_fn,
            ..Default::default()
        },
    );

    assert_eq!(handler.call(Request::new("10.0.0.1"))?.status, 200);

    // Had the nested filter double-entered the drain, the counter would be
    // unbalanced and this would never return.
    with_maintenance(ident, || ());

    Ok(())
}

#[test]
fn test_gate_reopens_after_operator_panic() -> Result<()> {
    let (ident, ident_fn) = ident("operator-panic");

    let handler = wrap_maintenance_limit(
        Arc::new(ok),
        MaintenanceLimitOptions {
            ident_fn,
            max_wait: Duration::from_millis(50),
            ..Default::default()
        },
    );

    let operator = {
        let ident = ident.clone();
        thread::spawn(move || with_maintenance(ident, || panic!("maintenance failed")))
    };
    assert!(operator.join().is_err());

    assert_eq!(handler.call(Request::new("10.0.0.1"))?.status, 200);

    Ok(())
}
