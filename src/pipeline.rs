//! Chains stages as separate processes.
//!
//! Every stage is the same program started with a different subcommand. The
//! standard output of a stage is connected to the standard input of the next
//! one by an OS pipe, so stages only share the bytes flowing through it.
//! A stage that dies closes its pipes, which its neighbours observe as the
//! end of their input or as a broken pipe.

use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;

use crossbeam::channel;

use crate::PipelineError;

/// Where the first stage reads from or the last stage writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// The standard stream of the calling process
    Inherit,
    Path(PathBuf),
    /// A pipe handed to the caller, see [`RunningPipeline::take_stdin`]
    Piped,
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Inherit
    }
}

impl Endpoint {
    fn stdio(&self, reading: bool) -> Result<Stdio, PipelineError> {
        match self {
            Endpoint::Inherit => Ok(Stdio::inherit()),
            Endpoint::Piped => Ok(Stdio::piped()),
            Endpoint::Path(path) => {
                let file = if reading {
                    File::open(path)
                } else {
                    File::create(path)
                };
                file.map(Stdio::from)
                    .map_err(|source| PipelineError::Endpoint {
                        path: path.clone(),
                        source,
                    })
            }
        }
    }
}

/// A stage subcommand and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub name: String,
    pub args: Vec<String>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        StageSpec {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for StageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Describes a chain of stages before it is started.
#[derive(Debug, Clone)]
pub struct Pipeline {
    program: PathBuf,
    stages: Vec<StageSpec>,
    input: Endpoint,
    output: Endpoint,
}

impl Pipeline {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Pipeline {
            program: program.into(),
            stages: Vec::new(),
            input: Endpoint::Inherit,
            output: Endpoint::Inherit,
        }
    }

    pub fn stage(&mut self, stage: StageSpec) -> &mut Self {
        self.stages.push(stage);
        self
    }

    pub fn input(&mut self, input: Endpoint) -> &mut Self {
        self.input = input;
        self
    }

    pub fn output(&mut self, output: Endpoint) -> &mut Self {
        self.output = output;
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Starts one process per stage. If a stage fails to start, the stages
    /// already running are killed.
    pub fn spawn(&self) -> Result<RunningPipeline, PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::Empty);
        }
        let mut running = RunningPipeline {
            stages: Vec::with_capacity(self.stages.len()),
            stdin: None,
            stdout: None,
        };
        if let Err(e) = self.spawn_into(&mut running) {
            running.abort();
            return Err(e);
        }
        Ok(running)
    }

    fn spawn_into(&self, running: &mut RunningPipeline) -> Result<(), PipelineError> {
        let last = self.stages.len() - 1;
        let mut upstream: Option<ChildStdout> = None;
        for (i, spec) in self.stages.iter().enumerate() {
            let stdin = match upstream.take() {
                Some(pipe) => Stdio::from(pipe),
                None => self.input.stdio(true)?,
            };
            let stdout = if i == last {
                self.output.stdio(false)?
            } else {
                Stdio::piped()
            };

            let mut child = Command::new(&self.program)
                .arg(&spec.name)
                .args(&spec.args)
                .stdin(stdin)
                .stdout(stdout)
                .spawn()
                .map_err(|source| PipelineError::Spawn {
                    stage: spec.name.clone(),
                    source,
                })?;
            debug!("Started stage {} ({}) as process {}", i, spec, child.id());

            if i == 0 {
                running.stdin = child.stdin.take();
            }
            if i == last {
                running.stdout = child.stdout.take();
            } else {
                // Moved into the next stage, so only the two neighbours hold
                // the pipe
                upstream = child.stdout.take();
            }
            running.stages.push((spec.name.clone(), child));
        }
        info!("Started a pipeline of {} stages", running.stages.len());
        Ok(())
    }
}

/// Exit statuses of a finished pipeline, in stage order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub statuses: Vec<(String, ExitStatus)>,
}

impl PipelineReport {
    pub fn success(&self) -> bool {
        self.statuses.iter().all(|(_, status)| status.success())
    }

    /// Names of the stages that did not exit cleanly
    pub fn failed(&self) -> impl Iterator<Item = &str> {
        self.statuses
            .iter()
            .filter(|(_, status)| !status.success())
            .map(|(name, _)| name.as_str())
    }
}

/// Handle to the processes of a started [`Pipeline`].
#[derive(Debug)]
pub struct RunningPipeline {
    stages: Vec<(String, Child)>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl RunningPipeline {
    /// Input of the first stage, if the pipeline input is [`Endpoint::Piped`].
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Output of the last stage, if the pipeline output is
    /// [`Endpoint::Piped`].
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Terminates one stage. Its neighbours see their pipes close.
    pub fn kill(&mut self, stage: usize) -> Result<(), PipelineError> {
        let (name, child) = self
            .stages
            .get_mut(stage)
            .ok_or(PipelineError::NoSuchStage(stage))?;
        warn!("Killing stage {} ({})", stage, name);
        child.kill()?;
        Ok(())
    }

    fn abort(&mut self) {
        for (name, child) in &mut self.stages {
            if let Err(e) = child.kill() {
                debug!("Could not kill stage {}: {}", name, e);
            }
            let _ = child.wait();
        }
    }

    /// Waits for every stage to exit. Pipes not taken by the caller are
    /// closed first so the outer stages can finish.
    pub fn wait(mut self) -> Result<PipelineReport, PipelineError> {
        drop(self.stdin.take());
        drop(self.stdout.take());

        let (sender, receiver) = channel::unbounded();
        let mut names = Vec::with_capacity(self.stages.len());
        let mut waiters = Vec::with_capacity(self.stages.len());
        for (index, (name, mut child)) in self.stages.drain(..).enumerate() {
            let sender = sender.clone();
            names.push(name.clone());
            let waiter = thread::Builder::new()
                .name(format!("wait-{}", name))
                .spawn(move || {
                    let status = child.wait();
                    let _ = sender.send((index, status));
                })?;
            waiters.push(waiter);
        }
        drop(sender);

        let mut statuses: Vec<Option<ExitStatus>> = vec![None; names.len()];
        for (index, status) in receiver.iter() {
            let status = status?;
            if status.success() {
                debug!("Stage {} ({}) finished", index, names[index]);
            } else {
                warn!("Stage {} ({}) exited with {}", index, names[index], status);
            }
            statuses[index] = Some(status);
        }
        for waiter in waiters {
            let _ = waiter.join();
        }

        let statuses = names
            .into_iter()
            .zip(statuses)
            .filter_map(|(name, status)| status.map(|status| (name, status)))
            .collect();
        Ok(PipelineReport { statuses })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn shell(script: &str) -> StageSpec {
        let mut spec = StageSpec::new("-c");
        spec.arg(script);
        spec
    }

    #[test]
    fn empty_pipeline_is_refused() {
        assert!(matches!(
            Pipeline::new("sh").spawn(),
            Err(PipelineError::Empty)
        ));
    }

    #[test]
    fn bytes_flow_through_every_stage() {
        let mut running = Pipeline::new("sh")
            .stage(shell("cat"))
            .stage(shell("tr a-z A-Z"))
            .stage(shell("rev"))
            .input(Endpoint::Piped)
            .output(Endpoint::Piped)
            .spawn()
            .unwrap();
        assert_eq!(running.len(), 3);

        let mut stdin = running.take_stdin().unwrap();
        stdin.write_all(b"photons\n").unwrap();
        drop(stdin);
        let mut out = String::new();
        running.take_stdout().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "SNOTOHP\n");

        let report = running.wait().unwrap();
        assert!(report.success());
        assert_eq!(report.statuses.len(), 3);
    }

    #[test]
    fn file_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::write(&input, "1,2\n3,4\n").unwrap();

        let report = Pipeline::new("sh")
            .stage(shell("cat"))
            .stage(shell("wc -l"))
            .input(Endpoint::Path(input))
            .output(Endpoint::Path(output.clone()))
            .spawn()
            .unwrap()
            .wait()
            .unwrap();
        assert!(report.success());
        assert_eq!(std::fs::read_to_string(output).unwrap().trim(), "2");
    }

    #[test]
    fn missing_input_file() {
        let result = Pipeline::new("sh")
            .stage(shell("cat"))
            .input(Endpoint::Path(PathBuf::from("/no/such/photons.ptu")))
            .spawn();
        assert!(matches!(result, Err(PipelineError::Endpoint { .. })));
    }

    #[test]
    fn failing_stage_is_reported() {
        let report = Pipeline::new("sh")
            .stage(shell("cat > /dev/null"))
            .stage(shell("exit 3"))
            .input(Endpoint::Piped)
            .output(Endpoint::Piped)
            .spawn()
            .unwrap()
            .wait()
            .unwrap();
        assert!(!report.success());
        assert_eq!(report.failed().collect::<Vec<_>>(), vec!["-c"]);
        assert_eq!(report.statuses[1].1.code(), Some(3));
    }

    #[test]
    fn unknown_program_fails_to_spawn() {
        let result = Pipeline::new("/no/such/photoncorr")
            .stage(StageSpec::new("decode"))
            .spawn();
        assert!(matches!(result, Err(PipelineError::Spawn { .. })));
    }

    #[test]
    fn killed_stage_closes_the_chain() {
        let mut running = Pipeline::new("sh")
            .stage(shell("exec sleep 30"))
            .stage(shell("cat"))
            .input(Endpoint::Piped)
            .output(Endpoint::Piped)
            .spawn()
            .unwrap();
        assert!(matches!(running.kill(5), Err(PipelineError::NoSuchStage(5))));
        running.kill(0).unwrap();

        let report = running.wait().unwrap();
        assert!(!report.statuses[0].1.success());
        // cat saw the end of its input and finished normally
        assert!(report.statuses[1].1.success());
    }
}
