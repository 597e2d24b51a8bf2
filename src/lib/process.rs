//! C2 — run a shell command in a working directory and report back `{stdout, stderr, code}`.
//!
//! Adapted from `elba`'s own `build::process_builder::ProcessBuilder`: same chainable-builder
//! shape and the same `Display` impl (shell-escaped, for error messages and debug logs), but
//! `exec`/`exec_with_output` become async (`tokio::process::Command`) since every process
//! invocation is a suspension point, and failures surface as `ErrorKind::AcquisitionFailed`
//! carrying the combined `stderr || stdout`.
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::Path;

use failure::ResultExt;
use shell_escape::escape;

use crate::err::{Error, ErrorKind, ProcessError, Res};

/// The result of running a process to completion.
#[derive(Debug, Clone)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

impl Output {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// `stderr` if non-empty, otherwise `stdout`. Used to surface the most useful output when a
    /// process exits unsuccessfully.
    pub fn combined(&self) -> &str {
        if !self.stderr.trim().is_empty() {
            &self.stderr
        } else {
            &self.stdout
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProcessBuilder {
    program: OsString,
    args: Vec<OsString>,
    env: HashMap<String, Option<OsString>>,
    cwd: Option<OsString>,
}

impl fmt::Display for ProcessBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "`{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", escape(arg.to_string_lossy()))?;
        }
        write!(f, "`")
    }
}

impl ProcessBuilder {
    pub fn new<T: AsRef<OsStr>>(cmd: T) -> Self {
        ProcessBuilder {
            program: cmd.as_ref().to_os_string(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
        }
    }

    /// Builds a process from a single shell-invocation string (the form `installCommand` takes
    /// when it is a plain string rather than an argv list), by handing it to `sh -c` on unix and
    /// `cmd /C` on windows.
    pub fn from_shell_line(line: &str) -> Self {
        if cfg!(windows) {
            let mut b = ProcessBuilder::new("cmd");
            b.arg("/C").arg(line);
            b
        } else {
            let mut b = ProcessBuilder::new("sh");
            b.arg("-c").arg(line);
            b
        }
    }

    pub fn arg<T: AsRef<OsStr>>(&mut self, arg: T) -> &mut ProcessBuilder {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<T: AsRef<OsStr>>(&mut self, arguments: &[T]) -> &mut ProcessBuilder {
        self.args
            .extend(arguments.iter().map(|t| t.as_ref().to_os_string()));
        self
    }

    pub fn cwd<T: AsRef<OsStr>>(&mut self, path: T) -> &mut ProcessBuilder {
        self.cwd = Some(path.as_ref().to_os_string());
        self
    }

    pub fn env<T: AsRef<OsStr>>(&mut self, key: &str, val: T) -> &mut ProcessBuilder {
        self.env
            .insert(key.to_string(), Some(val.as_ref().to_os_string()));
        self
    }

    fn build_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        if let Some(cwd) = self.cwd.as_ref().map(Path::new) {
            command.current_dir(cwd);
        }
        command.args(&self.args);
        for (k, v) in &self.env {
            match v {
                Some(v) => {
                    command.env(k, v);
                }
                None => {
                    command.env_remove(k);
                }
            }
        }
        command
    }

    /// Runs the process, collecting its output regardless of exit status.
    pub async fn exec_with_output(&self) -> Res<Output> {
        let mut command = self.build_command();
        let output = command.output().await.with_context(|_| {
            ErrorKind::Other(format!("could not execute process {}", self))
        })?;

        Ok(Output {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code(),
        })
    }

    /// Runs the process, mapping a non-zero exit code to `AcquisitionFailed`.
    pub async fn exec(&self, context: &str) -> Res<Output> {
        let output = self.exec_with_output().await?;
        if output.success() {
            Ok(output)
        } else {
            let err = ProcessError {
                desc: format!("process {} didn't exit successfully", self),
                exit: None,
                output: None,
            };
            let _ = err; // description kept for potential future use; detail below carries output
            Err(Error::from(ErrorKind::AcquisitionFailed {
                name: context.to_string(),
                detail: format!("{} exited with {:?}:\n{}", self, output.code, output.combined()),
            }))
        }
    }
}
