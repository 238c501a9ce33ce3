#![allow(unused)]

use crate::task::{TaskGroupId, TaskPriority};
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Method {
    Schedule,
    Execute,
    GroupFinished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Schedule {
        group: TaskGroupId,
        priority: TaskPriority,
        task: Arc<str>,
        invocation: u32,
    },
    Execute {
        group: TaskGroupId,
        task: Arc<str>,
        invocation: u32,
    },
    GroupFinished {
        group: TaskGroupId,
    },
}

/// Records what the scheduler did, so tests can assert on ordering.
#[derive(Debug, Clone)]
pub(crate) struct Tracker {
    calls: Arc<DashMap<Method, Vec<Call>>>,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        let map = DashMap::new();
        map.insert(Method::Schedule, Vec::new());
        map.insert(Method::Execute, Vec::new());
        map.insert(Method::GroupFinished, Vec::new());

        Self {
            calls: Arc::new(map),
        }
    }

    pub(crate) fn record(&self, method: Method, call: Call) {
        self.calls
            .get_mut(&method)
            .expect("method not found")
            .push(call)
    }

    pub(crate) fn get_calls(&self, method: &Method) -> Vec<Call> {
        self.calls
            .get(method)
            .expect("method not found")
            .value()
            .clone()
    }

    pub(crate) fn num_calls(&self, method: &Method) -> usize {
        self.calls.get(method).map_or(0, |calls| calls.len())
    }
}
