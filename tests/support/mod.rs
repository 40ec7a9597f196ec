//! Shared helpers for the integration tests: collision-free pool
//! names, and a subprocess harness for exercising behavior a single
//! test process cannot observe on its own (remap-on-grow, robust-mutex
//! recovery across a killed process).
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Derives a pool name unique to this test run from a throwaway
/// temporary directory's randomized name, so parallel test binaries
/// (and repeated `cargo test` invocations) never collide on the same
/// backing region.
pub fn unique_pool_name(tag: &str) -> String {
    let dir = tempfile::tempdir().expect("tempdir should be creatable");
    let leaf = dir
        .path()
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("x")
        .to_owned();
    format!("crossmem_it_{}_{}", tag, leaf)
}

/// Re-invokes this test binary, selecting only `test_name` (by exact
/// match), with `CROSSMEM_CHILD_POOL` set to `pool_name`. The selected
/// test is expected to check `child_pool_name()` and behave as a
/// cooperating child process when it is set.
pub fn spawn_child(test_name: &str, pool_name: &str) -> Child {
    let exe = std::env::current_exe().expect("current_exe should be available to a test binary");
    Command::new(exe)
        .arg("--exact")
        .arg(test_name)
        .arg("--test-threads=1")
        .arg("--nocapture")
        .env("CROSSMEM_CHILD_POOL", pool_name)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn child test process")
}

/// Returns the pool name this process should attach to as a child, if
/// `CROSSMEM_CHILD_POOL` is set in its environment.
pub fn child_pool_name() -> Option<String> {
    std::env::var("CROSSMEM_CHILD_POOL").ok()
}

/// Like `spawn_child`, but pipes the child's stdout back to this
/// process instead of discarding it, so the parent can synchronize on
/// a line the child prints (see `wait_for_child_stdout_line`).
pub fn spawn_child_capturing_stdout(test_name: &str, pool_name: &str) -> Child {
    let exe = std::env::current_exe().expect("current_exe should be available to a test binary");
    Command::new(exe)
        .arg("--exact")
        .arg(test_name)
        .arg("--test-threads=1")
        .arg("--nocapture")
        .env("CROSSMEM_CHILD_POOL", pool_name)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn child test process")
}

/// Blocks until `needle` appears as a whole line of `child`'s stdout,
/// or panics once `timeout` elapses. Used to synchronize on a child
/// having reached a specific point (e.g. "lock acquired") before the
/// parent acts on it.
pub fn wait_for_child_stdout_line(child: &mut Child, needle: &str, timeout: Duration) {
    let stdout = child.stdout.take().expect("child stdout should be piped");
    let mut reader = BufReader::new(stdout);
    let deadline = Instant::now() + timeout;
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => panic!("child process closed stdout before printing {:?}", needle),
            Ok(_) => {
                if line.trim() == needle {
                    return;
                }
            }
            Err(e) => panic!("failed reading child stdout: {}", e),
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for child to print {:?}", needle);
        }
    }
}
