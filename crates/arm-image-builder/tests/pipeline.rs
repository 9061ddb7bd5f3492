use std::sync::{Arc, Mutex};

use arm_image_builder::executor::ExecCtx;
use arm_image_builder::pipeline::{BuildState, Outcome, Pipeline, Step, StepInfo, StepStatus};
use arm_image_builder::steps::{mount_plan, sort_partitions};
use arm_image_builder::ui::NullUi;
use arm_image_builder::{Error, Result};

type Log = Arc<Mutex<Vec<String>>>;

struct Numbered {
    id: &'static str,
    halts: bool,
    log: Log,
}

impl StepInfo for Numbered {
    fn id(&self) -> &'static str {
        self.id
    }
    fn label(&self) -> &'static str {
        "numbered"
    }
    fn privileged(&self) -> bool {
        false
    }
}

impl Step for Numbered {
    fn run(&mut self, _state: &mut BuildState, _ctx: &ExecCtx) -> Result<()> {
        self.log.lock().unwrap().push(format!("run {}", self.id));
        if self.halts {
            return Err(Error::msg("halt"));
        }
        Ok(())
    }

    fn cleanup(&mut self, _state: &mut BuildState, _ctx: &ExecCtx) -> Result<()> {
        self.log.lock().unwrap().push(format!("cleanup {}", self.id));
        Ok(())
    }
}

const IDS: [&str; 5] = ["s.one", "s.two", "s.three", "s.four", "s.five"];

#[test]
fn halting_step_k_cleans_up_k_down_to_one() {
    for k in 0..IDS.len() {
        let log = Log::default();
        let steps: Vec<Box<dyn Step>> = IDS
            .iter()
            .enumerate()
            .map(|(i, id)| {
                Box::new(Numbered {
                    id: *id,
                    halts: i == k,
                    log: log.clone(),
                }) as Box<dyn Step>
            })
            .collect();
        let mut pipeline = Pipeline::new(steps);
        let ctx = ExecCtx::new(Arc::new(NullUi));
        let outcome = pipeline.run(&mut BuildState::default(), &ctx);
        assert!(matches!(outcome, Outcome::Halted(_)));

        let mut want: Vec<String> = IDS[..=k].iter().map(|id| format!("run {id}")).collect();
        want.extend(IDS[..=k].iter().rev().map(|id| format!("cleanup {id}")));
        assert_eq!(*log.lock().unwrap(), want, "halt at step {}", k + 1);

        for (idx, (_, status)) in pipeline.status().into_iter().enumerate() {
            let expected = if idx <= k {
                StepStatus::CleanedUp
            } else {
                StepStatus::NotStarted
            };
            assert_eq!(status, expected);
        }
    }
}

#[test]
fn loop_partitions_sort_numerically() {
    let parts = sort_partitions(vec![
        "/dev/loop10p2".into(),
        "/dev/loop10p10".into(),
        "/dev/loop10p1".into(),
    ]);
    assert_eq!(parts, vec!["/dev/loop10p1", "/dev/loop10p2", "/dev/loop10p10"]);
}

#[test]
fn root_mount_precedes_boot() {
    let plan = mount_plan(
        &["/dev/loop0p1".to_string(), "/dev/loop0p2".to_string()],
        &["/boot".to_string(), "/".to_string()],
    )
    .unwrap();
    let order: Vec<&str> = plan.iter().map(|(_, mp)| mp.as_str()).collect();
    assert_eq!(order, vec!["/", "/boot"]);
    assert_eq!(plan[0].0, "/dev/loop0p2");
}
