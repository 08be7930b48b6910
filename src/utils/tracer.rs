use std::collections::HashMap;
use std::thread::{self, ThreadId};
use std::time::Instant;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{now_millis, Millis};

/// Finished executions kept by the tracer
pub const MAX_TRACED_EXECUTIONS: usize = 1000;

/// Aggregate timing for one traced method, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodStats {
    pub total_calls: u64,
    pub total_time: f64,
    pub min_time: f64,
    pub max_time: f64,
    pub avg_time: f64,
}

impl MethodStats {
    fn new(duration: f64) -> Self {
        Self {
            total_calls: 1,
            total_time: duration,
            min_time: duration,
            max_time: duration,
            avg_time: duration,
        }
    }

    fn update(&mut self, duration: f64) {
        self.total_calls += 1;
        self.total_time += duration;
        self.min_time = self.min_time.min(duration);
        self.max_time = self.max_time.max(duration);
        self.avg_time = self.total_time / self.total_calls as f64;
    }
}

/// One traced call within an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall {
    pub method: String,
    pub start_time: Millis,
    pub duration: f64,
    pub stack_depth: usize,
    pub parent: Option<String>,
    pub is_cache_hit: bool,
}

/// Calls recorded between an execution's start and end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracedExecution {
    pub prompt_id: String,
    pub start_time: Millis,
    pub end_time: Option<Millis>,
    pub total_time: f64,
    pub method_calls: Vec<MethodCall>,
}

#[derive(Debug, Default)]
struct TracerState {
    current: HashMap<String, TracedExecution>,
    executions: Vec<TracedExecution>,
    method_stats: HashMap<String, MethodStats>,
    /// Open calls per thread; nesting never crosses threads
    call_stacks: HashMap<ThreadId, Vec<String>>,
}

/// Opt-in method-call tracer.
///
/// A disabled tracer hands out inert guards and reports no stats.
#[derive(Debug)]
pub struct ExecutionTracer {
    enabled: bool,
    state: Mutex<TracerState>,
}

impl ExecutionTracer {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: Mutex::new(TracerState::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn start_execution(&self, prompt_id: &str, now: Millis) {
        if !self.enabled {
            return;
        }
        self.state.lock().current.insert(
            prompt_id.to_string(),
            TracedExecution {
                prompt_id: prompt_id.to_string(),
                start_time: now,
                end_time: None,
                total_time: 0.0,
                method_calls: Vec::new(),
            },
        );
    }

    /// Close an execution and move it to the finished list
    pub fn end_execution(&self, prompt_id: &str, now: Millis) -> Option<TracedExecution> {
        if !self.enabled {
            return None;
        }
        let mut state = self.state.lock();
        let mut execution = state.current.remove(prompt_id)?;
        execution.end_time = Some(now);
        execution.total_time = now.saturating_sub(execution.start_time) as f64;

        state.executions.push(execution.clone());
        if state.executions.len() > MAX_TRACED_EXECUTIONS {
            let excess = state.executions.len() - MAX_TRACED_EXECUTIONS;
            state.executions.drain(..excess);
        }
        debug!(%prompt_id, calls = execution.method_calls.len(), "Finished traced execution");
        Some(execution)
    }

    /// Start timing a call; the call is recorded when the guard drops
    pub fn trace(&self, method: impl Into<String>) -> TraceGuard<'_> {
        if !self.enabled {
            return TraceGuard {
                tracer: None,
                method: String::new(),
                thread: thread::current().id(),
                prompt_id: None,
                start: Instant::now(),
                start_time: 0,
                cache_hit: false,
            };
        }

        let method = method.into();
        let thread = thread::current().id();
        self.state
            .lock()
            .call_stacks
            .entry(thread)
            .or_default()
            .push(method.clone());
        TraceGuard {
            tracer: Some(self),
            method,
            thread,
            prompt_id: None,
            start: Instant::now(),
            start_time: now_millis(),
            cache_hit: false,
        }
    }

    fn record(&self, guard: &TraceGuard<'_>) {
        let duration = guard.start.elapsed().as_secs_f64() * 1000.0;
        let mut state = self.state.lock();

        let (stack_depth, parent) = match state.call_stacks.get_mut(&guard.thread) {
            Some(stack) => {
                if let Some(pos) = stack.iter().rposition(|m| *m == guard.method) {
                    stack.remove(pos);
                }
                (stack.len() + 1, stack.last().cloned())
            }
            None => (1, None),
        };
        if state.call_stacks.get(&guard.thread).is_some_and(|stack| stack.is_empty()) {
            state.call_stacks.remove(&guard.thread);
        }

        match state.method_stats.get_mut(&guard.method) {
            Some(stats) => stats.update(duration),
            None => {
                state.method_stats.insert(guard.method.clone(), MethodStats::new(duration));
            }
        }

        let call = MethodCall {
            method: guard.method.clone(),
            start_time: guard.start_time,
            duration,
            stack_depth,
            parent,
            is_cache_hit: guard.cache_hit,
        };

        let TracerState { current, .. } = &mut *state;
        let execution = match &guard.prompt_id {
            Some(prompt_id) => current.get_mut(prompt_id),
            None if current.len() == 1 => current.values_mut().next(),
            None => None,
        };
        if let Some(execution) = execution {
            execution.method_calls.push(call);
        }
    }

    /// Per-method statistics; empty when disabled
    pub fn method_stats(&self) -> HashMap<String, MethodStats> {
        if !self.enabled {
            return HashMap::new();
        }
        self.state.lock().method_stats.clone()
    }

    /// Finished executions, oldest first
    pub fn executions(&self) -> Vec<TracedExecution> {
        self.state.lock().executions.clone()
    }

    pub fn reset(&self) {
        *self.state.lock() = TracerState::default();
    }
}

/// Guard for one traced call
pub struct TraceGuard<'a> {
    tracer: Option<&'a ExecutionTracer>,
    method: String,
    /// Thread whose call stack this call was pushed on
    thread: ThreadId,
    prompt_id: Option<String>,
    start: Instant,
    start_time: Millis,
    cache_hit: bool,
}

impl<'a> TraceGuard<'a> {
    /// Attribute the call to a specific execution
    pub fn for_prompt(mut self, prompt_id: &str) -> Self {
        if self.tracer.is_some() {
            self.prompt_id = Some(prompt_id.to_string());
        }
        self
    }

    pub fn mark_cache_hit(&mut self, hit: bool) {
        self.cache_hit = hit;
    }
}

impl<'a> Drop for TraceGuard<'a> {
    fn drop(&mut self) {
        if let Some(tracer) = self.tracer {
            tracer.record(self);
        }
    }
}
