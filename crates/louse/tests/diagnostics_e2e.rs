//! Diagnostic-output tests for the engine.
//!
//! These verify the literal text of the fatal aligned-allocation aborts,
//! the runtime free diagnostics, and the teardown report.
//!
//! All scenarios run as subprocesses: we spawn the test binary with a
//! scenario name in the environment and inspect the child's exit status
//! and stderr. The diagnostics bypass the test harness capture (they are
//! raw fd writes), so only a child process can observe them.

use louse::api;
use std::ptr;

// ---------------------------------------------------------------------------
// Helpers: run the current test binary with LOUSE_DIAGNOSTIC_SCENARIO set
// and collect the child's output.
// ---------------------------------------------------------------------------

fn run_scenario(scenario_name: &str, envs: &[(&str, &str)]) -> std::process::Output {
    let exe = std::env::current_exe().expect("cannot determine test binary path");

    let mut command = std::process::Command::new(&exe);
    command
        .env("LOUSE_DIAGNOSTIC_SCENARIO", scenario_name)
        // The driver detects the env var and runs the scenario instead of
        // its normal no-op body.
        .arg("--exact")
        .arg("scenario_driver")
        .arg("--nocapture")
        // Prevent interference between the harness and the scenario.
        .env("RUST_TEST_THREADS", "1");
    for (key, value) in envs {
        command.env(key, value);
    }
    command.output().expect("failed to spawn subprocess")
}

/// The scenario must die by abort, with `expected_msg` on stderr.
fn expect_abort_subprocess(scenario_name: &str, expected_msg: &str) {
    let output = run_scenario(scenario_name, &[]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(
        !output.status.success(),
        "subprocess for scenario '{}' should have been killed by a signal, \
         but exited successfully. stderr:\n{}",
        scenario_name,
        stderr
    );

    assert!(
        stderr.contains(expected_msg),
        "subprocess for scenario '{}' stderr does not contain '{}'. \
         Full stderr:\n{}",
        scenario_name,
        expected_msg,
        stderr
    );
}

/// The scenario must finish cleanly; returns the child's stderr (which
/// carries the diagnostics and the teardown report).
fn report_from_subprocess(scenario_name: &str, envs: &[(&str, &str)]) -> String {
    let output = run_scenario(scenario_name, envs);
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    assert!(
        output.status.success(),
        "subprocess for scenario '{}' should have exited cleanly. stderr:\n{}",
        scenario_name,
        stderr
    );
    stderr
}

// ---------------------------------------------------------------------------
// Scenario driver: when LOUSE_DIAGNOSTIC_SCENARIO is set, run the
// requested scenario instead of normal test assertions.
// ---------------------------------------------------------------------------

#[test]
fn scenario_driver() {
    let scenario = match std::env::var("LOUSE_DIAGNOSTIC_SCENARIO") {
        Ok(s) => s,
        Err(_) => return, // Not a subprocess invocation; skip.
    };

    match scenario.as_str() {
        "posix_memalign" => scenario_posix_memalign(),
        "aligned_alloc" => scenario_aligned_alloc(),
        "single_leak" => scenario_single_leak(),
        "leak_dedup" => scenario_leak_dedup(),
        "leak_truncation" => scenario_leak_truncation(),
        "leaks_disabled" => scenario_leaks_disabled(),
        "mismatched_free" => scenario_mismatched_free(),
        "buffer_overrun" => scenario_buffer_overrun(),
        _ => panic!("unknown scenario: {}", scenario),
    }
}

/// Scenario: call posix_memalign, which is unsupported and must abort.
fn scenario_posix_memalign() {
    unsafe {
        let mut out = ptr::null_mut();
        api::posix_memalign(&mut out, 64, 128);
    }
    unreachable!("posix_memalign did not abort");
}

/// Scenario: call aligned_alloc, which is unsupported and must abort.
fn scenario_aligned_alloc() {
    unsafe {
        api::aligned_alloc(64, 128);
    }
    unreachable!("aligned_alloc did not abort");
}

/// Scenario: leak a single 17-byte block and leave through the interposed
/// exit, so the block is still the registry head when the report walks.
fn scenario_single_leak() {
    unsafe {
        let p = api::malloc(17);
        assert!(!p.is_null());
        api::exit(0);
    }
}

/// Scenario: leak the same call site ten times. Run with traces disabled
/// so every leak resolves to the same (empty) text and dedup collapses
/// the whole set into one reported entry.
fn scenario_leak_dedup() {
    unsafe {
        for _ in 0..10 {
            let p = api::malloc(33);
            assert!(!p.is_null());
        }
        api::exit(0);
    }
}

/// Scenario: several leaks with LOUSE_MAXLEAKS=1 set by the parent; the
/// walk must stop after the first unique entry with the truncation notice.
fn scenario_leak_truncation() {
    unsafe {
        for _ in 0..5 {
            let p = api::malloc(21);
            assert!(!p.is_null());
        }
        api::exit(0);
    }
}

/// Scenario: leak with the leak phase switched off.
fn scenario_leaks_disabled() {
    unsafe {
        let p = api::malloc(64);
        assert!(!p.is_null());
        api::exit(0);
    }
}

/// Scenario: scalar new released with array delete. The diagnostic is
/// printed but the block is still released, so the scenario returns.
fn scenario_mismatched_free() {
    unsafe {
        let p = api::operator_new(32);
        assert!(!p.is_null());
        api::operator_delete_array(p);
    }
}

/// Scenario: write 8 bytes into a 4-byte block, then free it.
fn scenario_buffer_overrun() {
    unsafe {
        let p = api::malloc(4) as *mut u8;
        assert!(!p.is_null());
        for i in 0..8usize {
            p.add(i).write(0x41);
        }
        api::free(p as *mut _);
    }
}

// ---------------------------------------------------------------------------
// Test: aligned-allocation entry points abort with their diagnostics
// ---------------------------------------------------------------------------

#[test]
fn posix_memalign_aborts_with_not_handled() {
    expect_abort_subprocess("posix_memalign", "posix_memalign() is not handled");
}

#[test]
fn aligned_alloc_aborts_with_not_handled() {
    expect_abort_subprocess("aligned_alloc", "aligned_alloc() is not handled");
}

// ---------------------------------------------------------------------------
// Test: a single leak produces the banner, totals and its leak entry
// ---------------------------------------------------------------------------

#[test]
fn single_leak_report_carries_the_literal_text() {
    let stderr = report_from_subprocess("single_leak", &[]);

    assert!(
        stderr.contains("RESULTS --------------------------------------------------------"),
        "missing report banner. stderr:\n{}",
        stderr
    );
    assert!(stderr.contains("# total number of allocations: "));
    assert!(stderr.contains("# total size of allocations: "));
    assert!(
        stderr.contains("check error: leak of size 17 byte(s), allocated with via malloc():"),
        "missing the 17-byte leak entry. stderr:\n{}",
        stderr
    );
}

// ---------------------------------------------------------------------------
// Test: same-site leaks are deduplicated into one unique entry
// ---------------------------------------------------------------------------

#[test]
fn same_site_leaks_collapse_into_one_unique_entry() {
    let stderr = report_from_subprocess("leak_dedup", &[("LOUSE_WITHTRACES", "off")]);

    assert!(
        stderr.contains("check error: leak of size 33 byte(s), allocated with via malloc():"),
        "missing the first leak entry. stderr:\n{}",
        stderr
    );
    assert!(stderr.contains("  # no stack available"));
    assert!(
        stderr.contains("found 1 unique leaks(s),"),
        "dedup did not collapse the leaks to one unique entry. stderr:\n{}",
        stderr
    );
    assert!(stderr.contains(" duplicates, with total size of "));
}

// ---------------------------------------------------------------------------
// Test: the walk stops at LOUSE_MAXLEAKS with the truncation notice
// ---------------------------------------------------------------------------

#[test]
fn leak_report_truncates_at_max_leaks() {
    let stderr = report_from_subprocess(
        "leak_truncation",
        &[("LOUSE_MAXLEAKS", "1"), ("LOUSE_WITHTRACES", "off")],
    );

    assert!(
        stderr.contains("check error: leak of size 21 byte(s), allocated with via malloc():"),
        "missing the first leak entry. stderr:\n{}",
        stderr
    );
    assert!(
        stderr.contains("# leak report truncated after 1 unique leak(s)"),
        "missing the truncation notice. stderr:\n{}",
        stderr
    );
    assert!(
        !stderr.contains(" with total size of "),
        "truncation must replace the closing summary. stderr:\n{}",
        stderr
    );
}

// ---------------------------------------------------------------------------
// Test: LOUSE_WITHLEAKS=off keeps the totals but skips the leak phase
// ---------------------------------------------------------------------------

#[test]
fn leak_phase_can_be_disabled() {
    let stderr = report_from_subprocess("leaks_disabled", &[("LOUSE_WITHLEAKS", "off")]);

    assert!(stderr.contains("RESULTS --------------------------------------------------------"));
    assert!(stderr.contains("# total number of allocations: "));
    assert!(
        !stderr.contains("leak of size"),
        "leak phase must be skipped. stderr:\n{}",
        stderr
    );
}

// ---------------------------------------------------------------------------
// Test: mismatched release pairs print the runtime diagnostic
// ---------------------------------------------------------------------------

#[test]
fn mismatched_free_reports_both_kinds() {
    let stderr = report_from_subprocess("mismatched_free", &[]);

    assert!(
        stderr.contains("runtime error: trying to delete[] memory pointer"),
        "missing the mismatch diagnostic. stderr:\n{}",
        stderr
    );
    assert!(
        stderr.contains("that was originally allocated via new"),
        "missing the origin kind. stderr:\n{}",
        stderr
    );
}

// ---------------------------------------------------------------------------
// Test: a trailing overrun prints size and origin in the diagnostic
// ---------------------------------------------------------------------------

#[test]
fn buffer_overrun_reports_size_and_origin() {
    let stderr = report_from_subprocess("buffer_overrun", &[]);

    assert!(
        stderr.contains("runtime error: buffer overrun after memory pointer"),
        "missing the overrun diagnostic. stderr:\n{}",
        stderr
    );
    assert!(
        stderr.contains("of size 4 that was originally allocated via malloc()"),
        "missing size and origin. stderr:\n{}",
        stderr
    );
}
