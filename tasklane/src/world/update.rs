use crate::world::WorldModule;
use std::cmp::Ordering;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// The stages a world update goes through, in order. Each phase becomes one
/// task group that depends on the group of the previous phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UpdatePhase {
    PreAsync,

    /// Functions of this phase run concurrently with each other and may be
    /// split into batches of components.
    Async,

    PostAsync,
    PostTransform,
}

impl UpdatePhase {
    pub const COUNT: usize = 4;

    pub const ALL: [UpdatePhase; Self::COUNT] = [
        UpdatePhase::PreAsync,
        UpdatePhase::Async,
        UpdatePhase::PostAsync,
        UpdatePhase::PostTransform,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_async(self) -> bool {
        self == UpdatePhase::Async
    }
}

pub type UpdateFn = dyn Fn(&UpdateContext<'_>) + Send + Sync + 'static;

/// Passed to an update function for every invocation.
pub struct UpdateContext<'a> {
    pub(crate) module: &'a dyn WorldModule,
    pub(crate) frame: u64,
    pub(crate) components: Range<u32>,
    pub(crate) simulating: bool,
}

impl UpdateContext<'_> {
    /// Module the function was registered for.
    pub fn module(&self) -> &dyn WorldModule {
        self.module
    }

    /// Number of the world update this invocation belongs to, starting at 1.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Components this invocation is responsible for. Empty for modules that
    /// don't report a component count.
    pub fn components(&self) -> Range<u32> {
        self.components.clone()
    }

    pub fn is_simulating(&self) -> bool {
        self.simulating
    }
}

/// Describes an update function to register with a world.
///
/// ```
/// use tasklane::world::{UpdateFunctionDesc, UpdatePhase};
///
/// let desc = UpdateFunctionDesc::new("physics::integrate", UpdatePhase::Async, |ctx| {
///     for _component in ctx.components() {}
/// })
/// .with_granularity(256)
/// .only_when_simulating();
///
/// assert_eq!(desc.granularity, 256);
/// ```
#[derive(Clone)]
pub struct UpdateFunctionDesc {
    /// Unique within the world. Dependencies refer to functions by name.
    pub name: Arc<str>,

    pub function: Arc<UpdateFn>,

    pub phase: UpdatePhase,

    /// Skipped entirely while the world doesn't simulate.
    pub only_update_when_simulating: bool,

    /// Components per invocation. 0 processes everything in one invocation.
    /// Only allowed for async functions.
    pub granularity: u32,

    /// Among functions whose dependencies are satisfied, higher priorities
    /// run first.
    pub priority: f32,

    /// Functions of the same phase that have to run before this one. Not
    /// allowed for async functions.
    pub depends_on: Vec<Arc<str>>,
}

impl UpdateFunctionDesc {
    pub fn new<F>(name: impl Into<Arc<str>>, phase: UpdatePhase, function: F) -> Self
    where
        F: Fn(&UpdateContext<'_>) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            function: Arc::new(function),
            phase,
            only_update_when_simulating: false,
            granularity: 0,
            priority: 0.0,
            depends_on: Vec::new(),
        }
    }

    pub fn with_granularity(mut self, granularity: u32) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_priority(mut self, priority: f32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, name: impl Into<Arc<str>>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    pub fn only_when_simulating(mut self) -> Self {
        self.only_update_when_simulating = true;
        self
    }

    /// Invocation ranges for a module with `component_count` components.
    ///
    /// Empty when there is nothing to process. A single range when the
    /// function isn't batched or everything fits into one batch.
    pub(crate) fn batches(&self, component_count: Option<u32>) -> Vec<Range<u32>> {
        let Some(count) = component_count else {
            return vec![0..0];
        };

        if count == 0 {
            return Vec::new();
        }

        if self.granularity == 0 || count <= self.granularity {
            return vec![0..count];
        }

        (0..count.div_ceil(self.granularity))
            .map(|batch| {
                let first = batch * self.granularity;
                first..first.saturating_add(self.granularity).min(count)
            })
            .collect()
    }

    /// Orders functions that compete for the same position: higher priority
    /// first, then by name.
    fn cmp_position(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| self.name.cmp(&other.name))
    }
}

impl fmt::Debug for UpdateFunctionDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateFunctionDesc")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("only_update_when_simulating", &self.only_update_when_simulating)
            .field("granularity", &self.granularity)
            .field("priority", &self.priority)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

/// Inserts `item` into the ordered function list of its phase.
///
/// The position is after every dependency, and in front of the first
/// following function that sorts after it. If dependencies are missing the
/// item is handed back with their names and `list` is left untouched.
pub(crate) fn insert_ordered<T>(
    list: &mut Vec<T>,
    item: T,
    desc: impl Fn(&T) -> &UpdateFunctionDesc,
) -> Result<usize, (T, Vec<Arc<str>>)> {
    let new = desc(&item);
    let mut missing = Vec::new();
    let mut first_allowed = 0;

    for dependency in &new.depends_on {
        match list.iter().position(|f| desc(f).name == *dependency) {
            Some(idx) => first_allowed = first_allowed.max(idx + 1),
            None => missing.push(Arc::clone(dependency)),
        }
    }

    if !missing.is_empty() {
        return Err((item, missing));
    }

    let position = list[first_allowed..]
        .iter()
        .position(|f| new.cmp_position(desc(f)) == Ordering::Less)
        .map_or(list.len(), |offset| first_allowed + offset);

    list.insert(position, item);
    Ok(position)
}
