// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Process-wide configuration. The config can be installed once per
//! process, so each case re-runs this test binary filtered to itself and
//! does its work in the child.

use std::process::{Command, Output};

use rask_fiber::{config, Builder, Fiber, FiberConfig, PooledFixedSizeStack};

const CASE_VAR: &str = "RASK_FIBER_CONFIG_CASE";

fn is_child(case: &str) -> bool {
    std::env::var(CASE_VAR).as_deref() == Ok(case)
}

fn run_child(case: &str, env: &[(&str, &str)]) -> Output {
    Command::new(std::env::current_exe().unwrap())
        .args(["--exact", case, "--nocapture", "--test-threads=1"])
        .env(CASE_VAR, case)
        .envs(env.iter().copied())
        .output()
        .expect("failed to re-run test binary")
}

fn assert_child_passed(out: &Output) {
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(
        out.status.success() && stdout.contains("1 passed"),
        "child failed:\nstdout: {}\nstderr: {}",
        stdout,
        String::from_utf8_lossy(&out.stderr)
    );
}

#[test]
fn installed_config_drives_defaults() {
    const CASE: &str = "installed_config_drives_defaults";
    if is_child(CASE) {
        let installed = FiberConfig::builder()
            .stack_size(64 * 1024)
            .guard_pages(false)
            .pool_capacity(2)
            .build()
            .unwrap();
        assert!(config::init(installed.clone()));
        assert!(!config::init(FiberConfig::default()));
        assert_eq!(*config::current(), installed);

        let mut plain = Fiber::new(|| {}).unwrap();
        plain.join().unwrap();

        let pool = PooledFixedSizeStack::from_config().unwrap();
        let mut fibers: Vec<Fiber> = (0..4)
            .map(|_| Builder::new().allocator(pool.clone()).spawn(|| {}).unwrap())
            .collect();
        for fiber in &mut fibers {
            fiber.join().unwrap();
        }
        // Two regions kept, the surplus went back to the backing allocator.
        assert_eq!(pool.idle(), 2);
        return;
    }
    assert_child_passed(&run_child(CASE, &[]));
}

#[test]
fn environment_feeds_first_read() {
    const CASE: &str = "environment_feeds_first_read";
    if is_child(CASE) {
        let config = config::current();
        assert_eq!(config.stack_size, 96 * 1024);
        assert!(!config.guard_pages);
        assert_eq!(config.pool_capacity, 5);
        // Reading installed the environment config for good.
        assert!(!config::init(FiberConfig::default()));
        assert_eq!(config::current().pool_capacity, 5);
        return;
    }
    assert_child_passed(&run_child(
        CASE,
        &[
            ("RASK_FIBER_STACK_SIZE", "98304"),
            ("RASK_FIBER_GUARD_PAGES", "no"),
            ("RASK_FIBER_POOL_CAPACITY", "5"),
        ],
    ));
}
