//! The per-task state machine.
//!
//! [`evaluate`] is pure: given the current state, the requested target,
//! and the task's failure context, it decides whether the transition is
//! legal and which side-effect commands it requires. The
//! [`crate::StateManager`] interprets the commands inside the enclosing
//! storage transaction.

use stratus_core::ScheduleStatus;

use ScheduleStatus::*;

/// Side effects a transition requires, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkCommand {
    /// Persist the new status and append a task event.
    UpdateState,
    /// Instruct the agent to terminate the remote process.
    Kill,
    /// Create a replacement task with a fresh task id.
    Reschedule,
    /// Bump the task's failure count.
    IncrementFailures,
    /// Remove the task record.
    Delete,
}

/// Failure-accounting context consulted on FINISHED/FAILED targets.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext {
    pub is_service: bool,
    /// −1 means unlimited.
    pub max_task_failures: i32,
    /// Failure count before this transition.
    pub failure_count: i32,
}

impl TransitionContext {
    /// Whether a task entering FAILED still has reschedule budget.
    fn reschedule_on_failure(&self) -> bool {
        self.is_service
            || self.max_task_failures == -1
            || self.failure_count < self.max_task_failures - 1
    }
}

/// Outcome of evaluating a requested transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eval {
    /// The target equals the current state; nothing happens.
    Noop,
    /// The transition is legal. `to` carries the (possibly rewritten)
    /// target actually entered.
    Allowed {
        to: ScheduleStatus,
        commands: Vec<WorkCommand>,
    },
    /// The transition is not in the table. `commands` is non-empty only
    /// for the zombie case: a terminated task reported live again must
    /// be re-killed, but its state does not change.
    Illegal { commands: Vec<WorkCommand> },
}

fn allowed_targets(from: ScheduleStatus) -> &'static [ScheduleStatus] {
    match from {
        Init => &[Pending, Throttled, Unknown],
        Pending => &[Assigned, Killing],
        Throttled => &[Pending, Killing],
        Assigned => &[
            Starting, Running, Finished, Failed, Restarting, Killed, Killing, Lost, Preempting,
        ],
        Starting => &[
            Running, Finished, Failed, Restarting, Killing, Killed, Lost, Preempting,
        ],
        Running => &[Finished, Restarting, Failed, Killing, Killed, Lost, Preempting],
        Preempting | Restarting => &[Finished, Failed, Killing, Killed, Lost],
        Killing => &[Finished, Failed, Killed, Lost, Unknown],
        Finished | Failed | Killed | Lost => &[Unknown],
        Unknown => &[],
    }
}

/// Evaluate a requested transition.
///
/// An agent ceasing to report a task it had acknowledged is a loss, so
/// `STARTING/RUNNING → UNKNOWN` is rewritten to `LOST` before the table
/// is consulted.
pub fn evaluate(from: ScheduleStatus, to: ScheduleStatus, ctx: TransitionContext) -> Eval {
    if from == to {
        return Eval::Noop;
    }

    let to = if matches!(from, Starting | Running) && to == Unknown {
        Lost
    } else {
        to
    };

    if !allowed_targets(from).contains(&to) {
        // Zombie: a task we believe terminated is being revived
        // remotely. Kill it again; the record stays terminal.
        let commands = if (from.is_terminal() || from == Unknown)
            && matches!(to, Assigned | Starting | Running)
        {
            vec![WorkCommand::Kill]
        } else {
            Vec::new()
        };
        return Eval::Illegal { commands };
    }

    let mut commands = Vec::new();

    match to {
        // The record is deleted instead of updated; no agent involved.
        Killing if matches!(from, Pending | Throttled) => {
            commands.push(WorkCommand::Delete);
        }

        // A kill must reach whatever the agent is running. Entering
        // KILLING out of PREEMPTING/RESTARTING sends nothing: a kill is
        // already in flight.
        Killing | Restarting | Preempting if matches!(from, Assigned | Starting | Running) => {
            commands.push(WorkCommand::Kill);
        }

        // Remote removal of a terminated (or killing) task. A task
        // that never left INIT has nothing to remove.
        Unknown if from != Init => commands.push(WorkCommand::Delete),

        // A kill the operator requested must stick: terminations out of
        // KILLING never reschedule, service or not.
        Finished => {
            if ctx.is_service && from != Killing {
                commands.push(WorkCommand::Reschedule);
            }
        }

        Failed => {
            commands.push(WorkCommand::IncrementFailures);
            if ctx.reschedule_on_failure() && from != Killing {
                commands.push(WorkCommand::Reschedule);
            }
        }

        Killed => {
            if from != Killing {
                commands.push(WorkCommand::Reschedule);
            }
        }

        Lost => match from {
            // An assigned-but-unacknowledged task may still surface on
            // the agent, so the loss is both rescheduled and killed.
            Assigned => {
                commands.push(WorkCommand::Reschedule);
                commands.push(WorkCommand::Kill);
            }
            Starting | Running => commands.push(WorkCommand::Reschedule),
            Preempting | Restarting => {
                commands.push(WorkCommand::Kill);
                commands.push(WorkCommand::Reschedule);
            }
            _ => {}
        },

        _ => {}
    }

    // Every valid transition persists its new state, except entry into
    // UNKNOWN and except PENDING → KILLING, where the record is already
    // gone.
    if to != Unknown && !(from == Pending && to == Killing) {
        commands.push(WorkCommand::UpdateState);
    }

    Eval::Allowed { to, commands }
}
