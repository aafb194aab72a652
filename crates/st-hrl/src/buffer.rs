// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Fixed-capacity transition stores.
//!
//! Every store is a FIFO ring: once full, the oldest record is overwritten.
//! Sampling draws indices uniformly with replacement, so insertion order only
//! matters for eviction.

use rand::rngs::StdRng;
use rand::Rng;
use st_tensor::Tensor;

use crate::error::{HrlError, HrlResult};

#[derive(Clone, Debug)]
pub struct RingBuffer<T> {
    items: Vec<T>,
    capacity: usize,
    next: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> HrlResult<Self> {
        if capacity == 0 {
            return Err(HrlError::config("buffer_size", "must be non-zero"));
        }
        Ok(Self {
            items: Vec::new(),
            capacity,
            next: 0,
        })
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() < self.capacity {
            self.items.push(item);
        } else {
            self.items[self.next] = item;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.next = 0;
    }

    /// Draws `batch_size` records uniformly with replacement.
    pub fn sample<'a>(
        &'a self,
        batch_size: usize,
        rng: &mut StdRng,
        store: &'static str,
    ) -> HrlResult<Vec<&'a T>> {
        if self.items.is_empty() || batch_size == 0 {
            return Err(HrlError::EmptyBatch { store });
        }
        Ok((0..batch_size)
            .map(|_| &self.items[rng.gen_range(0..self.items.len())])
            .collect())
    }
}

/// Controller-level interaction record.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    pub state: Vec<f32>,
    pub next_state: Vec<f32>,
    pub goal: Vec<f32>,
    pub action: Vec<f32>,
    pub reward: f32,
    pub done: bool,
    pub cost: Option<f32>,
}

/// Column-stacked view of sampled controller transitions.
#[derive(Clone, Debug)]
pub struct TransitionBatch {
    pub state: Tensor,
    pub next_state: Tensor,
    pub goal: Tensor,
    pub action: Tensor,
    pub reward: Tensor,
    pub not_done: Tensor,
    pub cost: Option<Tensor>,
}

impl TransitionBatch {
    pub fn from_records(records: &[&Transition]) -> HrlResult<Self> {
        if records.is_empty() {
            return Err(HrlError::EmptyBatch { store: "controller" });
        }
        let rows = records.len();
        let column = |f: &dyn Fn(&Transition) -> f32| {
            Tensor::from_vec(rows, 1, records.iter().map(|t| f(*t)).collect())
        };
        let cost = if records.iter().all(|t| t.cost.is_some()) {
            Some(column(&|t| t.cost.unwrap_or(0.0))?)
        } else {
            None
        };
        Ok(Self {
            state: stack(records.iter().map(|t| t.state.as_slice()))?,
            next_state: stack(records.iter().map(|t| t.next_state.as_slice()))?,
            goal: stack(records.iter().map(|t| t.goal.as_slice()))?,
            action: stack(records.iter().map(|t| t.action.as_slice()))?,
            reward: column(&|t| t.reward)?,
            not_done: column(&|t| if t.done { 0.0 } else { 1.0 })?,
            cost,
        })
    }

    pub fn len(&self) -> usize {
        self.state.rows()
    }
}

/// Manager-level record covering one whole proposal interval.
#[derive(Clone, Debug, PartialEq)]
pub struct ManagerTransition {
    pub state: Vec<f32>,
    pub next_state: Vec<f32>,
    pub desired_goal: Vec<f32>,
    pub subgoal: Vec<f32>,
    pub reward: f32,
    pub done: bool,
    /// Low-level states visited during the interval, starting with `state`.
    pub states: Vec<Vec<f32>>,
    pub actions: Vec<Vec<f32>>,
}

impl ManagerTransition {
    /// Opens a record when the manager proposes `subgoal`.
    pub fn open(state: &[f32], desired_goal: &[f32], subgoal: &[f32]) -> Self {
        Self {
            state: state.to_vec(),
            next_state: state.to_vec(),
            desired_goal: desired_goal.to_vec(),
            subgoal: subgoal.to_vec(),
            reward: 0.0,
            done: false,
            states: vec![state.to_vec()],
            actions: Vec::new(),
        }
    }

    /// Appends one primitive step executed while pursuing the subgoal.
    pub fn record_step(&mut self, action: &[f32], next_state: &[f32], reward: f32) {
        self.reward += reward;
        self.actions.push(action.to_vec());
        self.states.push(next_state.to_vec());
    }

    /// Finalises the record at the end of the interval.
    pub fn close(mut self, state: &[f32], done: bool) -> Self {
        self.next_state = state.to_vec();
        self.done = done;
        self
    }

    pub fn steps(&self) -> usize {
        self.actions.len()
    }
}

/// Sampled manager records with the trajectories padded to a common length.
///
/// Missing states repeat the last visited state and missing actions are
/// `-inf`, which relabeling treats as a neutral (zero) reconstruction error.
#[derive(Clone, Debug)]
pub struct ManagerBatch {
    pub state: Tensor,
    pub next_state: Tensor,
    pub desired_goal: Tensor,
    pub subgoal: Tensor,
    pub reward: Tensor,
    pub not_done: Tensor,
    /// `batch · steps` rows, transition-major.
    pub state_seq: Tensor,
    /// `batch · steps` rows, transition-major.
    pub action_seq: Tensor,
    pub steps: usize,
}

impl ManagerBatch {
    /// Pads `records` to the longest interval among them.
    ///
    /// Records without any step are padded entirely with `-inf` actions. A
    /// batch in which no record has a step carries no action width and is
    /// rejected with [`HrlError::MissingInput`]; the trainer only stores
    /// intervals of at least one step.
    pub fn from_records(records: &[&ManagerTransition]) -> HrlResult<Self> {
        if records.is_empty() {
            return Err(HrlError::EmptyBatch { store: "manager" });
        }
        let rows = records.len();
        let steps = records.iter().map(|t| t.steps()).max().unwrap_or(0).max(1);
        let Some(first_action) = records.iter().find_map(|t| t.actions.first()) else {
            return Err(HrlError::MissingInput("manager action subsequence"));
        };
        let action_dim = first_action.len();
        let state_dim = records[0].state.len();

        let mut state_seq = Vec::with_capacity(rows * steps * state_dim);
        let mut action_seq = Vec::with_capacity(rows * steps * action_dim);
        for record in records {
            // The final visited state has no action attached.
            let visited = &record.states[..record.states.len().saturating_sub(1).max(1)];
            for t in 0..steps {
                let state = visited.get(t).or(visited.last()).unwrap_or(&record.state);
                state_seq.extend_from_slice(state);
                match record.actions.get(t) {
                    Some(action) => action_seq.extend_from_slice(action),
                    None => action_seq.extend(std::iter::repeat(f32::NEG_INFINITY).take(action_dim)),
                }
            }
        }
        let column = |f: &dyn Fn(&ManagerTransition) -> f32| {
            Tensor::from_vec(rows, 1, records.iter().map(|t| f(*t)).collect())
        };
        Ok(Self {
            state: stack(records.iter().map(|t| t.state.as_slice()))?,
            next_state: stack(records.iter().map(|t| t.next_state.as_slice()))?,
            desired_goal: stack(records.iter().map(|t| t.desired_goal.as_slice()))?,
            subgoal: stack(records.iter().map(|t| t.subgoal.as_slice()))?,
            reward: column(&|t| t.reward)?,
            not_done: column(&|t| if t.done { 0.0 } else { 1.0 })?,
            state_seq: Tensor::from_vec(rows * steps, state_dim, state_seq)?,
            action_seq: Tensor::from_vec(rows * steps, action_dim, action_seq)?,
            steps,
        })
    }

    pub fn len(&self) -> usize {
        self.state.rows()
    }
}

/// Encoded cost-model input paired with its realised cost label.
#[derive(Clone, Debug, PartialEq)]
pub struct CostSample {
    pub input: Vec<f32>,
    pub cost: f32,
}

pub(crate) fn stack<'a, I>(rows: I) -> HrlResult<Tensor>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let rows: Vec<&[f32]> = rows.into_iter().collect();
    Ok(Tensor::from_rows(&rows)?)
}
