//! External command collaborator
//!
//! Mounting, formatting, relabeling and the bulk copy all go through
//! external programs. The `CommandRunner` trait is the seam: production
//! code shells out via `std::process::Command`, tests substitute a
//! recording fake. The contract is captured stdout on success, a
//! descriptive error carrying the command line and stderr on failure.
//! No retries happen at this layer.

use common::{Error, Result};
use std::path::Path;
use std::process::Command;

pub trait CommandRunner: Send + Sync {
    /// Run a program with arguments, capturing output.
    fn run(&self, program: &str, args: &[&str]) -> Result<String>;
}

/// Runs commands on the host system.
#[derive(Debug, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program).args(args).output().map_err(|e| {
            Error::Command {
                command: command_line(program, args),
                detail: format!("failed to spawn: {}", e),
            }
        })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::Command {
                command: command_line(program, args),
                detail: format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            })
        }
    }
}

fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Mount `node` at `target`. `user_mount` selects pmount over mount.
pub fn mount(runner: &dyn CommandRunner, node: &str, target: &Path, user_mount: bool) -> Result<String> {
    let target = target.to_string_lossy();
    if user_mount {
        runner.run("pmount", &[node, target.as_ref()])
    } else {
        runner.run("mount", &[node, target.as_ref()])
    }
}

/// Unmount whatever is mounted at `target`.
pub fn unmount(runner: &dyn CommandRunner, target: &Path, user_mount: bool) -> Result<String> {
    let target = target.to_string_lossy();
    if user_mount {
        runner.run("pumount", &[target.as_ref()])
    } else {
        runner.run("umount", &[target.as_ref()])
    }
}

/// Format `node` as FAT32 with the given label.
pub fn format_fat32(runner: &dyn CommandRunner, node: &str, label: &str) -> Result<String> {
    runner.run("mkfs.fat", &["-F", "32", "-n", label, node])
}

/// Rewrite the FAT filesystem label of `node`.
pub fn update_label(runner: &dyn CommandRunner, node: &str, label: &str) -> Result<String> {
    runner.run("fatlabel", &[node, label])
}

/// Copy the content of `source` into `target`.
pub fn copy_tree(runner: &dyn CommandRunner, source: &Path, target: &Path) -> Result<String> {
    let source_content = format!("{}/.", source.to_string_lossy());
    let target = target.to_string_lossy();
    runner.run("cp", &["-r", &source_content, target.as_ref()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let runner = SystemCommandRunner;
        let output = runner.run("echo", &["hello"]).unwrap();
        assert_eq!(output.trim(), "hello");
    }

    #[test]
    fn test_nonzero_exit_reports_command_and_stderr() {
        let runner = SystemCommandRunner;
        let err = runner.run("ls", &["/definitely/not/here"]).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("ls /definitely/not/here"), "{}", text);
    }

    #[test]
    fn test_missing_program_is_an_error() {
        let runner = SystemCommandRunner;
        assert!(runner.run("no-such-program-here", &[]).is_err());
    }

    #[test]
    fn test_mount_argument_shape() {
        // Recorded through a fake: the worker tests rely on these exact
        // argument orders.
        struct Recorder(std::sync::Mutex<Vec<String>>);
        impl CommandRunner for Recorder {
            fn run(&self, program: &str, args: &[&str]) -> Result<String> {
                self.0
                    .lock()
                    .unwrap()
                    .push(command_line(program, args));
                Ok(String::new())
            }
        }

        let recorder = Recorder(std::sync::Mutex::new(Vec::new()));
        mount(&recorder, "/dev/sdb1", Path::new("/mnt/p0"), false).unwrap();
        mount(&recorder, "/dev/sdb1", Path::new("/mnt/p0"), true).unwrap();
        unmount(&recorder, Path::new("/mnt/p0"), true).unwrap();
        format_fat32(&recorder, "/dev/sdb1", "SUN").unwrap();
        update_label(&recorder, "/dev/sdb1", "MOON").unwrap();
        copy_tree(&recorder, Path::new("/src"), Path::new("/mnt/p0")).unwrap();

        let lines = recorder.0.lock().unwrap();
        assert_eq!(lines[0], "mount /dev/sdb1 /mnt/p0");
        assert_eq!(lines[1], "pmount /dev/sdb1 /mnt/p0");
        assert_eq!(lines[2], "pumount /mnt/p0");
        assert_eq!(lines[3], "mkfs.fat -F 32 -n SUN /dev/sdb1");
        assert_eq!(lines[4], "fatlabel /dev/sdb1 MOON");
        assert_eq!(lines[5], "cp -r /src/. /mnt/p0");
    }
}
