use anyhow::Result;

use crate::downloader::DownloadControl;

#[cfg(unix)]
use anyhow::Context;
#[cfg(unix)]
use nix::sys::signal::{self, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

#[cfg(unix)]
const PID_FILE: &str = "segdl.pid";

/// Ctrl-C cancels every download of this process.
pub fn cancel_on_ctrl_c(control: DownloadControl) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling");
            control.cancel();
        }
    });
}

/// SIGUSR1 pauses, SIGUSR2 resumes, SIGTERM cancels. The pid is recorded so
/// `--pause`, `--resume` and `--stop` from another shell can find us.
#[cfg(unix)]
pub fn listen_for_signals(control: DownloadControl) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut pause = signal(SignalKind::user_defined1())?;
    let mut resume = signal(SignalKind::user_defined2())?;
    let mut terminate = signal(SignalKind::terminate())?;

    std::fs::write(PID_FILE, std::process::id().to_string())
        .context("Failed to write pid file")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = pause.recv() => {
                    tracing::info!("pause requested");
                    control.pause();
                }
                _ = resume.recv() => {
                    tracing::info!("resume requested");
                    control.resume();
                }
                _ = terminate.recv() => {
                    tracing::info!("stop requested");
                    control.cancel();
                    break;
                }
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
pub fn listen_for_signals(_control: DownloadControl) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
pub fn get_running_pid() -> Result<Option<i32>> {
    if !std::path::Path::new(PID_FILE).exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(PID_FILE)?;
    let pid = content.trim().parse::<i32>()?;
    Ok(Some(pid))
}

#[cfg(unix)]
fn send_signal(pid: i32, signal: Signal) -> Result<()> {
    signal::kill(Pid::from_raw(pid), signal)?;
    Ok(())
}

#[cfg(unix)]
fn signal_running(signal: Signal, done: &str) -> Result<()> {
    if let Some(pid) = get_running_pid()? {
        send_signal(pid, signal)?;
        println!("{} (PID: {})", done, pid);
    } else {
        println!("No download is running.");
    }
    Ok(())
}

#[cfg(unix)]
pub fn stop_running() -> Result<()> {
    signal_running(Signal::SIGTERM, "Stopped downloads")
}

#[cfg(unix)]
pub fn pause_running() -> Result<()> {
    signal_running(Signal::SIGUSR1, "Paused downloads")
}

#[cfg(unix)]
pub fn resume_running() -> Result<()> {
    signal_running(Signal::SIGUSR2, "Resumed downloads")
}

pub fn cleanup_pid_file() {
    #[cfg(unix)]
    {
        let _ = std::fs::remove_file(PID_FILE);
    }
}
