use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::BuildConfig;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;

/// Identity of a step; generated by `#[Step(...)]`.
pub trait StepInfo {
    fn id(&self) -> &'static str;
    fn label(&self) -> &'static str;
    /// Needs root (loop devices, mounts, binfmt_misc).
    fn privileged(&self) -> bool;
}

/// One unit of the build. `run` returning `Err` halts the pipeline.
///
/// `cleanup` is called exactly once for every step whose `run` was entered,
/// in reverse order, whatever the outcome. It must undo only what `run`
/// actually did, so steps record their progress in their own fields.
pub trait Step: StepInfo + Send {
    fn run(&mut self, state: &mut BuildState, ctx: &ExecCtx) -> Result<()>;

    fn cleanup(&mut self, _state: &mut BuildState, _ctx: &ExecCtx) -> Result<()> {
        Ok(())
    }
}

/// Values produced by steps and consumed by later ones.
#[derive(Debug, Default)]
pub struct BuildState {
    pub config: BuildConfig,
    /// Downloaded (or local) source image.
    pub iso_path: Option<PathBuf>,
    /// Working image being modified.
    pub image_path: Option<PathBuf>,
    /// Partition devices in partition-number order.
    pub partitions: Vec<String>,
    pub mount_path: Option<PathBuf>,
    /// Emulator path as seen from inside the chroot.
    pub qemu_in_chroot: Option<PathBuf>,
    pub generated_data: BTreeMap<String, String>,
}

impl BuildState {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn iso_path(&self) -> Result<&Path> {
        self.iso_path
            .as_deref()
            .ok_or_else(|| Error::msg("source image has not been fetched"))
    }

    pub fn image_path(&self) -> Result<&Path> {
        self.image_path
            .as_deref()
            .ok_or_else(|| Error::msg("working image has not been created"))
    }

    pub fn mount_path(&self) -> Result<&Path> {
        self.mount_path
            .as_deref()
            .ok_or_else(|| Error::msg("image is not mounted"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    NotStarted,
    Running,
    Continued,
    Halted,
    Cancelled,
    CleanedUp,
}

#[derive(Debug)]
pub enum Outcome {
    Completed,
    Halted(Error),
    Cancelled,
}

impl Outcome {
    pub fn into_result(self) -> Result<()> {
        match self {
            Outcome::Completed => Ok(()),
            Outcome::Halted(e) => Err(e),
            Outcome::Cancelled => Err(Error::cancelled()),
        }
    }
}

pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
    status: Vec<StepStatus>,
}

impl Pipeline {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        let status = vec![StepStatus::NotStarted; steps.len()];
        Self { steps, status }
    }

    pub fn steps(&self) -> impl Iterator<Item = &dyn Step> {
        self.steps.iter().map(|s| s.as_ref())
    }

    pub fn status(&self) -> Vec<(&'static str, StepStatus)> {
        self.steps
            .iter()
            .zip(&self.status)
            .map(|(s, st)| (s.id(), *st))
            .collect()
    }

    pub fn run(&mut self, state: &mut BuildState, ctx: &ExecCtx) -> Outcome {
        let mut outcome = Outcome::Completed;

        for (idx, step) in self.steps.iter_mut().enumerate() {
            if ctx.cancelled() {
                outcome = Outcome::Cancelled;
                break;
            }
            let _span = tracing::info_span!("step", id = step.id()).entered();
            ctx.ui.say(step.label());
            self.status[idx] = StepStatus::Running;
            let started = Instant::now();
            let res = step.run(state, ctx);
            tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, ok = res.is_ok(), "step finished");

            match res {
                Ok(()) if ctx.cancelled() => {
                    self.status[idx] = StepStatus::Cancelled;
                    outcome = Outcome::Cancelled;
                    break;
                }
                Ok(()) => self.status[idx] = StepStatus::Continued,
                Err(e) if e.is_cancelled() || ctx.cancelled() => {
                    self.status[idx] = StepStatus::Cancelled;
                    outcome = Outcome::Cancelled;
                    break;
                }
                Err(e) => {
                    self.status[idx] = StepStatus::Halted;
                    outcome = Outcome::Halted(Error::msg(format!("{}: {e}", step.id())));
                    break;
                }
            }
        }

        self.cleanup(state, ctx);
        outcome
    }

    fn cleanup(&mut self, state: &mut BuildState, ctx: &ExecCtx) {
        let ctx = ctx.for_cleanup();
        for (idx, step) in self.steps.iter_mut().enumerate().rev() {
            if matches!(self.status[idx], StepStatus::NotStarted | StepStatus::CleanedUp) {
                continue;
            }
            if let Err(e) = step.cleanup(state, &ctx) {
                tracing::warn!(step = step.id(), "cleanup failed: {e}");
                ctx.ui.error(&format!("cleanup of {} failed: {e}", step.id()));
            }
            self.status[idx] = StepStatus::CleanedUp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::{NullUi, ScriptedUi};
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    enum Behaviour {
        Continue,
        Halt,
        Cancel,
        FailCleanup,
    }

    struct Recorder {
        id: &'static str,
        behaviour: Behaviour,
        log: Log,
    }

    impl StepInfo for Recorder {
        fn id(&self) -> &'static str {
            self.id
        }
        fn label(&self) -> &'static str {
            self.id
        }
        fn privileged(&self) -> bool {
            false
        }
    }

    impl Step for Recorder {
        fn run(&mut self, state: &mut BuildState, ctx: &ExecCtx) -> Result<()> {
            self.log.lock().unwrap().push(format!("run {}", self.id));
            state.generated_data.insert(self.id.into(), "ran".into());
            match self.behaviour {
                Behaviour::Halt => Err(Error::msg("boom")),
                Behaviour::Cancel => {
                    ctx.request_cancel();
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        fn cleanup(&mut self, _state: &mut BuildState, _ctx: &ExecCtx) -> Result<()> {
            self.log.lock().unwrap().push(format!("cleanup {}", self.id));
            match self.behaviour {
                Behaviour::FailCleanup => Err(Error::msg("umount busy")),
                _ => Ok(()),
            }
        }
    }

    fn pipeline(plan: Vec<(&'static str, Behaviour)>, log: &Log) -> Pipeline {
        Pipeline::new(
            plan
                .into_iter()
                .map(|(id, behaviour)| {
                    Box::new(Recorder {
                        id,
                        behaviour,
                        log: log.clone(),
                    }) as Box<dyn Step>
                })
                .collect(),
        )
    }

    fn ctx() -> ExecCtx {
        ExecCtx::new(Arc::new(NullUi))
    }

    #[test]
    fn completed_run_cleans_up_everything_in_reverse() {
        let log = Log::default();
        let mut p = pipeline(
            vec![
                ("a.one", Behaviour::Continue),
                ("a.two", Behaviour::Continue),
                ("a.three", Behaviour::Continue),
            ],
            &log,
        );
        let mut state = BuildState::default();
        assert!(matches!(p.run(&mut state, &ctx()), Outcome::Completed));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "run a.one",
                "run a.two",
                "run a.three",
                "cleanup a.three",
                "cleanup a.two",
                "cleanup a.one"
            ]
        );
        assert!(p.status().iter().all(|(_, s)| *s == StepStatus::CleanedUp));
    }

    #[test]
    fn halt_skips_later_steps_and_keeps_the_error() {
        let log = Log::default();
        let mut p = pipeline(
            vec![
                ("a.one", Behaviour::Continue),
                ("a.two", Behaviour::Halt),
                ("a.three", Behaviour::Continue),
            ],
            &log,
        );
        let mut state = BuildState::default();
        let Outcome::Halted(err) = p.run(&mut state, &ctx()) else {
            panic!("expected halt");
        };
        assert_eq!(err.to_string(), "a.two: boom");
        assert_eq!(
            *log.lock().unwrap(),
            vec!["run a.one", "run a.two", "cleanup a.two", "cleanup a.one"]
        );
        assert!(!state.generated_data.contains_key("a.three"));
        assert_eq!(p.status()[2], ("a.three", StepStatus::NotStarted));
    }

    #[test]
    fn cancel_stops_dispatch_but_not_cleanup() {
        let log = Log::default();
        let mut p = pipeline(
            vec![
                ("a.one", Behaviour::Continue),
                ("a.two", Behaviour::Cancel),
                ("a.three", Behaviour::Continue),
            ],
            &log,
        );
        let mut state = BuildState::default();
        assert!(matches!(p.run(&mut state, &ctx()), Outcome::Cancelled));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["run a.one", "run a.two", "cleanup a.two", "cleanup a.one"]
        );
    }

    #[test]
    fn cancelled_before_start_runs_nothing() {
        let log = Log::default();
        let mut p = pipeline(vec![("a.one", Behaviour::Continue)], &log);
        let ctx = ctx();
        ctx.request_cancel();
        assert!(matches!(p.run(&mut BuildState::default(), &ctx), Outcome::Cancelled));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn failing_cleanup_does_not_stop_earlier_cleanups() {
        let log = Log::default();
        let mut p = pipeline(
            vec![
                ("a.one", Behaviour::Continue),
                ("a.two", Behaviour::FailCleanup),
                ("a.three", Behaviour::Continue),
            ],
            &log,
        );
        let ui = Arc::new(ScriptedUi::default());
        let ctx = ExecCtx::new(ui.clone());
        assert!(matches!(p.run(&mut BuildState::default(), &ctx), Outcome::Completed));
        assert_eq!(
            log.lock().unwrap()[3..],
            ["cleanup a.three", "cleanup a.two", "cleanup a.one"]
        );
        assert!(
            ui.transcript()
                .iter()
                .any(|l| l == "error: cleanup of a.two failed: umount busy")
        );
    }
}
