use crate::domain::ProcessState;
use crate::ports::SupervisedProcess;

/// A process occupying one slot.
pub struct RunningSlot {
    pub process: Box<dyn SupervisedProcess>,
    pub queue_name: String,
    pub location: String,
}

/// A process reaped from its slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedProcess {
    pub queue_name: String,
    pub location: String,
    pub pid: Option<u32>,
    pub command_line: String,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error_output: String,
}

/// Fixed number of process slots; a slot is free when it holds nothing.
pub struct SlotTable {
    slots: Vec<Option<RunningSlot>>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn running(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn running_for(&self, queue_name: &str, location: &str) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|slot| slot.queue_name == queue_name && slot.location == location)
            .count()
    }

    pub fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.is_none())
    }

    /// Puts `slot` at `index`; returns `false` if the index is out of range or taken.
    pub fn occupy(&mut self, index: usize, slot: RunningSlot) -> bool {
        match self.slots.get_mut(index) {
            Some(entry) if entry.is_none() => {
                *entry = Some(slot);
                true
            }
            _ => false,
        }
    }

    /// Polls every occupied slot and frees the ones whose process has exited.
    pub fn reap(&mut self) -> Vec<FinishedProcess> {
        let mut finished = Vec::new();
        for entry in &mut self.slots {
            let Some(slot) = entry else {
                continue;
            };
            let ProcessState::Exited(exit_code) = slot.process.poll() else {
                continue;
            };
            finished.push(FinishedProcess {
                queue_name: slot.queue_name.clone(),
                location: slot.location.clone(),
                pid: slot.process.pid(),
                command_line: slot.process.command_line().to_string(),
                exit_code,
                output: slot.process.output(),
                error_output: slot.process.error_output(),
            });
            *entry = None;
        }
        finished
    }
}
