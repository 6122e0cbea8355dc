use chrono::{DateTime, FixedOffset};
use log::{debug, info, warn};

use crate::{
    clock::WallTime,
    error::ScheduleError,
    schedule::{ScheduledTask, TaskArgs},
    store::{LoadOutcome, TaskStore},
};

/// Ids are a `u8` with 0 reserved, so the set can never exceed this.
pub const MAX_TASK_LIMIT: usize = 254;

pub type FireCallback<A> = Box<dyn FnMut(ScheduledTask<A>)>;

pub struct TaskScheduler<A, S> {
    store: S,
    tasks: Vec<ScheduledTask<A>>,
    max_tasks: usize,
    callback: Option<FireCallback<A>>,
}

impl<A: TaskArgs, S: TaskStore> TaskScheduler<A, S> {
    pub fn new(store: S, max_tasks: usize) -> Self {
        Self {
            store,
            tasks: Vec::new(),
            max_tasks: max_tasks.clamp(1, MAX_TASK_LIMIT),
            callback: None,
        }
    }

    pub fn set_callback(&mut self, callback: impl FnMut(ScheduledTask<A>) + 'static) {
        self.callback = Some(Box::new(callback));
    }

    /// Replaces the in-memory set from the backend. Asynchronous backends
    /// finish on a later [`Self::run`].
    pub fn load(&mut self) -> Result<(), ScheduleError> {
        match self.store.load()? {
            LoadOutcome::Ready(records) => self.replace_from_records(records),
            LoadOutcome::Pending => debug!("schedule load pending"),
        }
        Ok(())
    }

    pub fn save(&mut self) -> Result<(), ScheduleError> {
        let records = self.records();
        self.store.save(&records)?;
        Ok(())
    }

    pub fn add_task(&mut self, mut task: ScheduledTask<A>) -> Result<u8, ScheduleError> {
        if self.tasks.len() >= self.max_tasks {
            return Err(ScheduleError::Full(self.max_tasks));
        }

        if task.id == 0 {
            task.id = self.generate_uid();
        } else if self.contains(task.id) {
            return Err(ScheduleError::DuplicateId(task.id));
        }

        let id = task.id;
        self.tasks.push(task);
        let records = self.records();
        self.store.append(&records)?;
        Ok(id)
    }

    pub fn remove_task(&mut self, id: u8) -> Result<(), ScheduleError> {
        let index = self.position(id)?;
        self.tasks.remove(index);
        self.save()
    }

    pub fn update_task(&mut self, id: u8, mut task: ScheduledTask<A>) -> Result<(), ScheduleError> {
        let index = self.position(id)?;
        task.id = id;
        self.tasks[index] = task;
        self.save()
    }

    pub fn task(&self, id: u8) -> Option<&ScheduledTask<A>> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn tasks(&self) -> &[ScheduledTask<A>] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn generate_uid(&self) -> u8 {
        loop {
            let id = fastrand::u8(1..=u8::MAX);
            if !self.contains(id) {
                return id;
            }
        }
    }

    pub fn next_run_epoch(&self, now: DateTime<FixedOffset>) -> Option<i64> {
        self.tasks
            .iter()
            .filter_map(|task| task.next_run_epoch(now))
            .min()
    }

    /// Evaluates every task against `now`. Returns how many tasks fired.
    pub fn run(&mut self, now: &WallTime) -> usize {
        if let Some(result) = self.store.poll_load() {
            match result {
                Ok(records) => self.replace_from_records(records),
                Err(err) => warn!("schedule load failed, keeping {} tasks: {err}", self.len()),
            }
        }

        if !now.synced || self.tasks.is_empty() {
            return 0;
        }

        let mut fired = 0;
        let mut dirty = false;
        for task in &mut self.tasks {
            let due = task.is_due(now);
            if due && !task.executed {
                task.executed = true;
                dirty = true;
                fired += 1;
                info!("schedule {} fired at {now}: {}", task.id, task.args);
                if let Some(callback) = self.callback.as_mut() {
                    callback(task.clone());
                }
            } else if !due && task.executed && task.enabled && task.repeat.contains(now.weekday) {
                // Only an enabled task on one of its days re-arms.
                task.executed = false;
                dirty = true;
            }
        }

        if dirty {
            if let Err(err) = self.save() {
                warn!("failed to persist schedule state: {err}");
            }
        }

        fired
    }

    fn replace_from_records(&mut self, records: Vec<String>) {
        let mut tasks: Vec<ScheduledTask<A>> = Vec::with_capacity(records.len());
        for record in records {
            if tasks.len() >= self.max_tasks {
                warn!("schedule limit of {} reached, ignoring remaining records", self.max_tasks);
                break;
            }

            match record.parse::<ScheduledTask<A>>() {
                Ok(task) if tasks.iter().any(|known| known.id == task.id) => {
                    warn!("dropping duplicate schedule id {}", task.id);
                }
                Ok(task) => tasks.push(task),
                Err(err) => warn!("dropping invalid schedule record `{record}`: {err}"),
            }
        }

        info!("loaded {} scheduled tasks", tasks.len());
        self.tasks = tasks;
    }

    fn records(&self) -> Vec<String> {
        self.tasks.iter().map(ToString::to_string).collect()
    }

    fn contains(&self, id: u8) -> bool {
        self.tasks.iter().any(|task| task.id == id)
    }

    fn position(&self, id: u8) -> Result<usize, ScheduleError> {
        self.tasks
            .iter()
            .position(|task| task.id == id)
            .ok_or(ScheduleError::NotFound(id))
    }
}
