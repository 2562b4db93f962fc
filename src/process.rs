use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{EseError, IoResultExt, Result};
use crate::utils::make_executable;

/// Files receiving the standard output and error of a script run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLogs {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl RunLogs {
    pub fn new(work_dir: impl AsRef<Path>, output_prefix: &str) -> Self {
        let work_dir = work_dir.as_ref();
        Self {
            stdout: work_dir.join(format!("{output_prefix}.out")),
            stderr: work_dir.join(format!("{output_prefix}.err")),
        }
    }
}

/// Spawns `script` as the leader of a new process group, so that its whole
/// process tree can be signalled at once.
fn spawn_script(
    shell: &Path,
    script: &Path,
    work_dir: &Path,
    output_prefix: &str,
) -> Result<(Child, RunLogs)> {
    let logs = RunLogs::new(work_dir, output_prefix);
    let out_file = fs::File::create(&logs.stdout).at(&logs.stdout)?;
    let err_file = fs::File::create(&logs.stderr).at(&logs.stderr)?;

    make_executable(script)?;

    let child = Command::new(shell)
        .arg(script)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(out_file)
        .stderr(err_file)
        .process_group(0)
        .spawn()
        .at(script)?;
    Ok((child, logs))
}

/// Runs `script` with `shell` inside `work_dir` and waits for it to exit.
///
/// Output is written to `<output_prefix>.out` and `<output_prefix>.err` in `work_dir`.
pub fn run_script(
    shell: impl AsRef<Path>,
    script: impl AsRef<Path>,
    work_dir: impl AsRef<Path>,
    output_prefix: &str,
) -> Result<RunLogs> {
    let script = script.as_ref();
    let (mut child, logs) = spawn_script(shell.as_ref(), script, work_dir.as_ref(), output_prefix)?;

    let status = child.wait().at(script)?;
    if !status.success() {
        return Err(EseError::Tool {
            script: script.to_owned(),
            status,
        });
    }

    Ok(logs)
}

/// Runs `script`, killing it if it is still alive once `budget` has elapsed.
///
/// A killed run is an [`EseError::Timeout`] carrying whatever the script
/// printed to its standard output. The exit status of a run that finished in
/// time is returned as-is.
pub fn run_with_timeout(
    shell: impl AsRef<Path>,
    script: impl AsRef<Path>,
    work_dir: impl AsRef<Path>,
    output_prefix: &str,
    budget: Duration,
    poll_interval: Duration,
) -> Result<ExitStatus> {
    let script = script.as_ref();
    let (mut child, logs) = spawn_script(shell.as_ref(), script, work_dir.as_ref(), output_prefix)?;
    let start = Instant::now();

    loop {
        if let Some(status) = child.try_wait().at(script)? {
            log::info!(
                "{script:?} finished in {:.1}s with {status}",
                start.elapsed().as_secs_f64()
            );
            return Ok(status);
        }

        let elapsed = start.elapsed();
        if elapsed >= budget {
            kill_process_group(&mut child, script);
            child.wait().at(script)?;
            let stdout = fs::read_to_string(&logs.stdout).unwrap_or_default();
            return Err(EseError::Timeout {
                script: script.to_owned(),
                budget,
                stdout,
            });
        }

        thread::sleep(poll_interval.min(budget - elapsed));
    }
}

/// Kills the process group led by `child`, then `child` itself.
fn kill_process_group(child: &mut Child, script: &Path) {
    let group = format!("-{}", child.id());
    match Command::new("kill")
        .args(["-KILL", "--", &group])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => log::warn!("cannot kill process group of {script:?}: kill exited with {status}"),
        Err(e) => log::warn!("cannot kill process group of {script:?}: {e}"),
    }
    // The child may exit between the poll and the kill.
    if let Err(e) = child.kill() {
        log::debug!("cannot kill {script:?}: {e}");
    }
}
