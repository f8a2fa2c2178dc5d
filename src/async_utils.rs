//! Asynchronous utilities for use with Tokio.
//!
//! OCR inference, image decoding and model loading are all CPU-bound and
//! synchronous. We push them onto Tokio's blocking pool so the executor stays
//! responsive, which matters mostly for `--timeout-secs`.
//!
//! This is also where we keep our small amount of async file I/O.

use std::{future::Future, panic};

use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::prelude::*;

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Ok(value),
        Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
        Err(err) => Err(anyhow!("blocking task did not complete: {}", err)),
    }
}

/// Run `fut` to completion on a fresh multi-threaded runtime, then shut the
/// runtime down without waiting for blocking tasks.
///
/// A timed-out OCR call leaves its inference running on the blocking pool.
/// Dropping the runtime normally would wait for it, so a one-shot process
/// would outlive its timeout.
pub fn block_on_and_abandon_blocking_tasks<F: Future>(fut: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start Tokio runtime")?;
    let output = runtime.block_on(fut);
    runtime.shutdown_background();
    Ok(output)
}

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %String::from_utf8_lossy(&output.stdout),
        "Standard output from command"
    );

    if output.status.success() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
        Ok(())
    } else {
        warn!(
            command_name = command_name,
            output = %stderr,
            "Standard error from failed command",
        );
        if let Some(exit_code) = output.status.code() {
            Err(anyhow!(
                "{} failed with exit code {} and error output:\n{}",
                command_name,
                exit_code,
                stderr,
            ))
        } else {
            Err(anyhow!(
                "{} failed with error output:\n{}",
                command_name,
                stderr,
            ))
        }
    }
}

/// Create a writer for either a file or standard output.
async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write `text` and a trailing newline to either standard output or a file.
pub async fn write_text_output(path: Option<&Path>, text: &str) -> Result<()> {
    let mut writer = BufWriter::new(create_writer(path).await?);
    writer
        .write_all(text.as_bytes())
        .await
        .context("Failed to write output")?;
    writer
        .write_all(b"\n")
        .await
        .context("Failed to write output")?;
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}

/// Read the trimmed, non-blank lines of a text file.
pub async fn read_non_blank_lines(path: &Path) -> Result<Vec<String>> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    Ok(data
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

#[cfg(test)]
mod tests {
    use std::process::Command;

    use super::*;

    #[tokio::test]
    async fn spawn_blocking_returns_value() -> Result<()> {
        let value = spawn_blocking_propagating_panics(|| 6 * 7).await?;
        assert_eq!(value, 42);
        Ok(())
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn spawn_blocking_propagates_panics() {
        let _ = spawn_blocking_propagating_panics::<_, ()>(|| panic!("boom")).await;
    }

    #[tokio::test]
    async fn text_output_ends_with_newline() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("out.txt");
        write_text_output(Some(&path), "Get Lucky").await?;
        assert_eq!(std::fs::read_to_string(&path)?, "Get Lucky\n");
        write_text_output(Some(&path), "").await?;
        assert_eq!(std::fs::read_to_string(&path)?, "\n");
        Ok(())
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("titles.txt");
        std::fs::write(&path, "Get Lucky\n\n   \n  Instant Crush \n")?;
        assert_eq!(
            read_non_blank_lines(&path).await?,
            vec!["Get Lucky", "Instant Crush"]
        );
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn command_failure_is_reported() {
        let output = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .output()
            .expect("sh should run");
        let err = check_for_command_failure("sh", &output).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"), "{msg}");
        assert!(msg.contains("oops"), "{msg}");
    }

    #[test]
    #[cfg(unix)]
    fn stderr_from_successful_commands_is_not_an_error() {
        let output = Command::new("sh")
            .args(["-c", "echo 'Warning: low resolution' >&2"])
            .output()
            .expect("sh should run");
        assert!(check_for_command_failure("sh", &output).is_ok());
    }

    #[test]
    fn shutdown_does_not_wait_for_abandoned_blocking_work() -> Result<()> {
        let start = std::time::Instant::now();
        let timed_out = block_on_and_abandon_blocking_tasks(async {
            let slow = spawn_blocking_propagating_panics(|| {
                std::thread::sleep(std::time::Duration::from_secs(5))
            });
            tokio::time::timeout(std::time::Duration::from_millis(100), slow)
                .await
                .is_err()
        })?;
        assert!(timed_out);
        assert!(
            start.elapsed() < std::time::Duration::from_secs(3),
            "waited {:?} for the runtime to shut down",
            start.elapsed()
        );
        Ok(())
    }
}
