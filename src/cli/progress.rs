use std::collections::HashSet;
use std::fmt::Display;
use std::time::Duration;

use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::plan::TaskKey;

#[derive(PartialEq, Eq)]
pub enum StepStatus {
    Done,
    Pending,
    InProgress,
    Disabled,
    Skipped,
    Failed,
}

pub struct StepContext {
    step_num: usize,
    steps: Vec<Step>,
}

pub struct Step {
    desc: &'static str,
    key: TaskKey,
    progress_bar: ProgressBar,
    disabled: bool,
}

/// Every pipeline task, in execution order.
const STEPS: [(TaskKey, &str); 7] = [
    (TaskKey::ResolveProjects, "Resolve projects"),
    (TaskKey::UpdateEnvironment, "Update PEX environment"),
    (TaskKey::UpdateTestCase, "Update test case"),
    (TaskKey::RunPex, "Run PEX"),
    (TaskKey::RunSim, "Run simulation"),
    (TaskKey::GenerateReport, "Generate report"),
    (TaskKey::Clean, "Clean scratch directories"),
];

impl StepContext {
    pub fn new(tasks: &HashSet<TaskKey>) -> Self {
        println!("Tasks:");

        let mut steps: Vec<Step> = STEPS
            .iter()
            .map(|&(key, desc)| Step {
                desc,
                key,
                progress_bar: ProgressBar::new_spinner(),
                disabled: !tasks.contains(&key),
            })
            .collect();

        let mp = MultiProgress::new();
        let num_steps = steps.iter().filter(|step| !step.disabled).count();
        let mut counter = 0;
        let width = format!("{}", num_steps).len();
        for (i, step) in steps.iter_mut().enumerate() {
            mp.insert(i + 1, step.progress_bar.clone());
            if step.disabled {
                let msg = Some(format!("[-/-] {}", step.desc));
                step.set_status(StepStatus::Disabled, msg);
            } else {
                counter += 1;
                let msg = Some(format!(
                    "[{:width$}/{:width$}] {}",
                    counter, num_steps, step.desc
                ));
                step.set_status(StepStatus::Pending, msg);
            }
        }

        let mut ctx = StepContext { step_num: 0, steps };
        if ctx.steps.first().map(|step| step.disabled).unwrap_or(false) {
            ctx.advance();
        }
        if let Some(current_step) = ctx.current_step() {
            current_step.set_status(StepStatus::InProgress, None);
        }
        ctx
    }

    pub fn advance(&mut self) {
        self.step_num += 1;
        while let Some(current_step) = self.current_step() {
            if !current_step.disabled {
                break;
            }
            self.step_num += 1;
        }
    }

    #[inline]
    pub fn current_step(&mut self) -> Option<&mut Step> {
        self.steps.get_mut(self.step_num)
    }

    /// Marks the current step failed and the remaining ones skipped if `res` is an error.
    pub fn check<T, E>(&mut self, res: std::result::Result<T, E>) -> std::result::Result<T, E> {
        if res.is_err() {
            if let Some(current_step) = self.current_step() {
                current_step.set_status(StepStatus::Failed, None);
                self.advance();
                while let Some(current_step) = self.current_step() {
                    current_step.set_status(StepStatus::Skipped, None);
                    self.advance();
                }
            }
            println!("\n");
        }

        res
    }

    pub fn finish(&mut self, key: TaskKey) {
        if let Some(current_step) = self.current_step() {
            if current_step.key != key {
                panic!("A step was completed out of order");
            }

            current_step.set_status(StepStatus::Done, None);

            self.advance();

            if let Some(current_step) = self.current_step() {
                current_step.set_status(StepStatus::InProgress, None);
            } else {
                self.done();
            }
        } else {
            panic!("A step was completed after all steps were marked completed");
        }
    }

    pub fn done(&mut self) {
        println!("\n\nCompleted all tasks");
    }
}

fn format_template(spinner: bool, status: impl Display) -> String {
    if spinner {
        format!("{{spinner:.green}} {:16} {{msg}}", status)
    } else {
        format!("  {:16} {{msg}}", status)
    }
}

impl Step {
    fn set_status(&mut self, status: StepStatus, msg: Option<String>) {
        let status_template = match status {
            StepStatus::Disabled => {
                format_template(false, "Disabled".truecolor(120, 120, 120).bold())
            }
            StepStatus::Done => format_template(false, "Done".green().bold()),
            StepStatus::Failed => format_template(false, "Failed".bright_white().on_red().bold()),
            StepStatus::InProgress => format_template(true, "In Progress".bright_white().bold()),
            StepStatus::Pending => format_template(true, "Pending".blue().bold()),
            StepStatus::Skipped => format_template(false, "Skipped".yellow().bold()),
        };
        if let Ok(style) = ProgressStyle::with_template(&status_template) {
            self.progress_bar.set_style(style);
        }

        if let Some(msg) = msg {
            self.progress_bar.set_message(msg);
        }

        if status == StepStatus::InProgress {
            self.progress_bar
                .enable_steady_tick(Duration::from_millis(200));
        } else if status != StepStatus::Pending {
            self.progress_bar.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_steps_are_skipped() {
        let tasks = HashSet::from([TaskKey::UpdateTestCase, TaskKey::GenerateReport]);
        let mut ctx = StepContext::new(&tasks);
        assert_eq!(ctx.current_step().unwrap().key, TaskKey::UpdateTestCase);
        ctx.finish(TaskKey::UpdateTestCase);
        assert_eq!(ctx.current_step().unwrap().key, TaskKey::GenerateReport);
        ctx.finish(TaskKey::GenerateReport);
        assert!(ctx.current_step().is_none());
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn test_out_of_order_finish() {
        let mut ctx = StepContext::new(&HashSet::from([TaskKey::RunPex, TaskKey::Clean]));
        ctx.finish(TaskKey::Clean);
    }

    #[test]
    fn test_check_fails_remaining_steps() {
        let mut ctx = StepContext::new(&HashSet::from([TaskKey::RunPex, TaskKey::Clean]));
        let res: std::result::Result<(), &str> = ctx.check(Err("boom"));
        assert!(res.is_err());
        assert!(ctx.current_step().is_none());
    }
}
