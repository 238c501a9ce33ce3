use crate::errors::WorldError;
use crate::runtime::Handle;
use crate::task::{Task, TaskGroupId, TaskNesting, TaskPriority};
use crate::world::update::insert_ordered;
use crate::world::{UpdateContext, UpdateFunctionDesc, UpdateFn, UpdatePhase};
use std::ops::Range;
use std::sync::Arc;

/// Something that owns update functions in a [`World`], such as a component
/// manager.
pub trait WorldModule: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Number of components batched async update functions iterate over.
    /// `None` for modules that don't manage components.
    fn component_count(&self) -> Option<u32> {
        None
    }
}

/// Identifies a module within the world it was added to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(usize);

impl ModuleId {
    pub fn index(&self) -> usize {
        self.0
    }
}

struct RegisteredFunction {
    module: ModuleId,
    desc: UpdateFunctionDesc,
}

/// One invocation range of an update function, resolved at schedule time.
struct ScheduledCall {
    module: Arc<dyn WorldModule>,
    function: Arc<UpdateFn>,
    components: Range<u32>,
}

impl ScheduledCall {
    fn call(&self, frame: u64, simulating: bool) {
        (self.function)(&UpdateContext {
            module: &*self.module,
            frame,
            components: self.components.clone(),
            simulating,
        });
    }
}

/// Turns the update functions registered by its modules into one chain of
/// task groups per frame.
///
/// Newly registered functions are only sorted in when the next update is
/// scheduled, so modules may register from anywhere during a frame without
/// disturbing the update in flight.
pub struct World {
    name: Arc<str>,
    modules: Vec<Option<Arc<dyn WorldModule>>>,
    functions: [Vec<RegisteredFunction>; UpdatePhase::COUNT],
    pending: Vec<RegisteredFunction>,
    simulating: bool,
    frame: u64,
    last_update: TaskGroupId,
}

impl World {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            modules: Vec::new(),
            functions: Default::default(),
            pending: Vec::new(),
            simulating: true,
            frame: 0,
            last_update: TaskGroupId::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_module(&mut self, module: Arc<dyn WorldModule>) -> ModuleId {
        let id = match self.modules.iter().position(Option::is_none) {
            Some(idx) => {
                self.modules[idx] = Some(module);
                idx
            }
            None => {
                self.modules.push(Some(module));
                self.modules.len() - 1
            }
        };

        ModuleId(id)
    }

    /// Removes the module together with all of its update functions.
    pub fn remove_module(&mut self, id: ModuleId) -> Result<Arc<dyn WorldModule>, WorldError> {
        let module = self
            .modules
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(WorldError::UnknownModule(id.0))?;

        for list in self.functions.iter_mut() {
            list.retain(|f| f.module != id);
        }
        self.pending.retain(|f| f.module != id);

        tracing::debug!(world = %self.name, module = module.name(), "removed module");
        Ok(module)
    }

    pub fn module(&self, id: ModuleId) -> Option<&Arc<dyn WorldModule>> {
        self.modules.get(id.0).and_then(Option::as_ref)
    }

    /// Registers an update function for `module`.
    ///
    /// Takes effect with the next scheduled update. Dependencies are only
    /// resolved then, so they may be registered in any order before it.
    pub fn register_update_function(
        &mut self,
        module: ModuleId,
        desc: UpdateFunctionDesc,
    ) -> Result<(), WorldError> {
        if self.module(module).is_none() {
            return Err(WorldError::UnknownModule(module.0));
        }

        if desc.phase.is_async() {
            if !desc.depends_on.is_empty() {
                return Err(WorldError::AsyncFunctionWithDependencies(desc.name));
            }
        } else if desc.granularity != 0 {
            return Err(WorldError::GranularityOnSyncFunction(desc.name));
        }

        if self.find(&desc.name).is_some() {
            return Err(WorldError::DuplicateFunction(desc.name));
        }

        self.pending.push(RegisteredFunction { module, desc });
        Ok(())
    }

    /// Returns false if no function with that name was registered.
    pub fn deregister_update_function(&mut self, name: &str) -> bool {
        let before = self.num_update_functions();

        for list in self.functions.iter_mut() {
            list.retain(|f| &*f.desc.name != name);
        }
        self.pending.retain(|f| &*f.desc.name != name);

        before != self.num_update_functions()
    }

    /// Registered functions, including those not yet sorted in.
    pub fn num_update_functions(&self) -> usize {
        self.functions.iter().map(Vec::len).sum::<usize>() + self.pending.len()
    }

    /// Names of the functions of `phase` in execution order. Pending
    /// registrations are not included.
    pub fn update_order(&self, phase: UpdatePhase) -> Vec<Arc<str>> {
        self.functions[phase.index()]
            .iter()
            .map(|f| Arc::clone(&f.desc.name))
            .collect()
    }

    pub fn set_simulating(&mut self, simulating: bool) {
        self.simulating = simulating;
    }

    pub fn is_simulating(&self) -> bool {
        self.simulating
    }

    /// Number of updates scheduled so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    fn find(&self, name: &str) -> Option<&RegisteredFunction> {
        self.functions
            .iter()
            .flatten()
            .chain(self.pending.iter())
            .find(|f| &*f.desc.name == name)
    }

    /// Sorts pending functions into their phases.
    ///
    /// Functions may depend on others registered in the same batch, so this
    /// repeats until no more functions can be placed. Functions whose
    /// dependencies never show up are dropped, the first of them is reported.
    fn flush_pending(&mut self) -> Result<(), WorldError> {
        let mut pending = std::mem::take(&mut self.pending);

        loop {
            let before = pending.len();
            let mut unresolved = Vec::new();

            for f in pending {
                let list = &mut self.functions[f.desc.phase.index()];
                if let Err(rejected) = insert_ordered(list, f, |f| &f.desc) {
                    unresolved.push(rejected);
                }
            }

            if unresolved.is_empty() {
                return Ok(());
            }

            if unresolved.len() == before {
                for (f, missing) in &unresolved {
                    tracing::warn!(
                        world = %self.name,
                        function = %f.desc.name,
                        ?missing,
                        "dropping update function with unresolved dependencies"
                    );
                }

                let (f, missing) = unresolved.swap_remove(0);
                return Err(WorldError::UnresolvedDependencies {
                    name: f.desc.name,
                    phase: f.desc.phase,
                    missing,
                });
            }

            pending = unresolved.into_iter().map(|(f, _)| f).collect();
        }
    }

    /// Resolves the invocations `f` consists of this frame.
    fn calls_for(&self, f: &RegisteredFunction) -> Vec<ScheduledCall> {
        let Some(module) = self.module(f.module) else {
            return Vec::new();
        };

        let count = module.component_count();
        let ranges = if f.desc.phase.is_async() {
            f.desc.batches(count)
        } else {
            vec![0..count.unwrap_or(0)]
        };

        ranges
            .into_iter()
            .map(|components| ScheduledCall {
                module: Arc::clone(module),
                function: Arc::clone(&f.desc.function),
                components,
            })
            .collect()
    }

    /// Functions of `phase` that run this frame, in order.
    fn active_functions(&self, phase: UpdatePhase) -> impl Iterator<Item = &RegisteredFunction> {
        let simulating = self.simulating;

        self.functions[phase.index()]
            .iter()
            .filter(move |f| simulating || !f.desc.only_update_when_simulating)
    }

    /// Submits one update of the world and returns the group of the last
    /// phase. Every phase group depends on the group of the previous phase.
    ///
    /// Sync phases execute their functions in order within one task. Every
    /// async function becomes a task with one invocation per component batch,
    /// functions without components to process get no task at all.
    ///
    /// # Errors
    ///
    /// Newly registered functions with dependencies that can't be found are
    /// dropped and reported. Nothing is scheduled in that case.
    pub fn schedule_update(&mut self, handle: &Handle) -> Result<TaskGroupId, WorldError> {
        debug_assert!(
            handle.is_task_group_finished(self.last_update),
            "world `{}` scheduled an update while the previous one is still running",
            self.name
        );

        self.flush_pending()?;
        self.frame += 1;

        let frame = self.frame;
        let simulating = self.simulating;
        let mut groups = [TaskGroupId::default(); UpdatePhase::COUNT];

        for phase in UpdatePhase::ALL {
            let group = handle.create_task_group(TaskPriority::EarlyThisFrame, None);
            groups[phase.index()] = group;

            if phase.is_async() {
                for f in self.active_functions(phase) {
                    let calls = self.calls_for(f);
                    if calls.is_empty() {
                        continue;
                    }

                    let multiplicity = match calls.len() {
                        1 => 0,
                        n => u32::try_from(n).unwrap_or(u32::MAX),
                    };

                    let task = Task::with_multiplicity(Arc::clone(&f.desc.name), multiplicity, move |ctx| {
                        if let Some(call) = calls.get(ctx.invocation() as usize) {
                            call.call(frame, simulating);
                        }
                    });
                    task.configure_task(Arc::clone(&f.desc.name), TaskNesting::Never, None);

                    handle.add_task_to_group(group, &Arc::new(task));
                }
            } else {
                let calls: Vec<ScheduledCall> = self
                    .active_functions(phase)
                    .flat_map(|f| self.calls_for(f))
                    .collect();

                if calls.is_empty() {
                    continue;
                }

                let name = format!("{}::{phase:?}", self.name);
                let task = Task::new(name, move |_| {
                    for call in &calls {
                        call.call(frame, simulating);
                    }
                });

                handle.add_task_to_group(group, &Arc::new(task));
            }
        }

        let dependencies: Vec<_> = groups.windows(2).map(|pair| (pair[1], pair[0])).collect();
        handle.add_task_group_dependency_batch(&dependencies);
        handle.start_task_group_batch(&groups);

        tracing::trace!(world = %self.name, frame, ?groups, "scheduled world update");

        self.last_update = groups[UpdatePhase::PostTransform.index()];
        Ok(self.last_update)
    }

    /// Schedules an update and waits for it to finish.
    pub fn update(&mut self, handle: &Handle) -> Result<(), WorldError> {
        let group = self.schedule_update(handle)?;
        handle.wait_for_group(group);
        Ok(())
    }
}
