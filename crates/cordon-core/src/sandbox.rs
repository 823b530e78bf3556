//! The box: one loaded program, its policy and its execution state
//!
//! Every entry into interpreted code goes through [`Sandbox::run_entry`],
//! which holds the box's reentrant lock for the duration of the entry. Nested
//! entries (a native method calling back into the same box on the same
//! thread) share the top-level entry's clock; only the outermost entry
//! accumulates elapsed time into the frame budget.

use crate::config::SandboxOptions;
use crate::error::{ExecError, ExecResult, LoadError, LoadResult};
use crate::host::{EmptyObjectModel, NativeRegistry, ObjectModel, ShimTable};
use crate::interpreter::{Budget, Interpreter};
use crate::policy::SecurityPolicy;
use crate::program::{Linker, LoadMode, Program, ValidationReport};
use crate::value::Value;
use cordon_bytecode::ProgramDef;
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Execution counters of a box
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SandboxStats {
    /// Entries started, nested ones included
    pub entries: u64,
    /// Instructions executed
    pub instructions: u64,
    /// Runtime faults and timeouts
    pub faults: u64,
    /// Time consumed since the last [`Sandbox::reset_frame_budget`]
    pub frame_elapsed: Duration,
    /// Time consumed since load
    pub total_elapsed: Duration,
    /// Current entry nesting depth
    pub depth: usize,
    /// Whether the box refuses further entries
    pub disabled: bool,
}

#[derive(Default)]
struct EntryState {
    depth: usize,
    entry_start: Option<Instant>,
    frame_used: Duration,
    total_used: Duration,
    entries: u64,
    instructions: u64,
    faults: u64,
    buffers: Vec<Vec<Value>>,
}

pub(crate) struct Inner {
    pub(crate) program: Program,
    pub(crate) policy: Arc<dyn SecurityPolicy>,
    pub(crate) object_model: Arc<dyn ObjectModel>,
    options: SandboxOptions,
    disabled: AtomicBool,
    state: ReentrantMutex<RefCell<EntryState>>,
}

/// A loaded, isolated program
///
/// Cloning yields another handle to the same box.
#[derive(Clone)]
pub struct Sandbox(pub(crate) Arc<Inner>);

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("classes", &self.0.program.classes().len())
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

/// Configures and loads a [`Sandbox`]
pub struct SandboxBuilder {
    policy: Arc<dyn SecurityPolicy>,
    natives: NativeRegistry,
    shims: ShimTable,
    object_model: Arc<dyn ObjectModel>,
    options: SandboxOptions,
    mode: LoadMode,
}

impl SandboxBuilder {
    /// Native types and methods programs may bind to
    pub fn natives(mut self, natives: NativeRegistry) -> Self {
        self.natives = natives;
        self
    }

    /// Shims consulted before ordinary resolution
    pub fn shims(mut self, shims: ShimTable) -> Self {
        self.shims = shims;
        self
    }

    /// Object model the shims query
    pub fn object_model(mut self, object_model: Arc<dyn ObjectModel>) -> Self {
        self.object_model = object_model;
        self
    }

    /// Execution limits
    pub fn options(mut self, options: SandboxOptions) -> Self {
        self.options = options;
        self
    }

    /// Load mode; `Simulate` links without running static constructors
    pub fn mode(mut self, mode: LoadMode) -> Self {
        self.mode = mode;
        self
    }

    fn linker(&self) -> Linker<'_> {
        Linker {
            policy: &*self.policy,
            natives: &self.natives,
            shims: &self.shims,
        }
    }

    /// Check every class of a blob without side effects
    pub fn validate(&self, blob: &[u8]) -> LoadResult<ValidationReport> {
        let def = ProgramDef::decode(blob)?;
        let report = self.linker().validate(&def)?;
        info!(
            classes = report.classes.len(),
            failed = report.errors().count(),
            "program validated"
        );
        Ok(report)
    }

    /// Decode and link a blob, then run static constructors (in `Run` mode)
    pub fn load(self, blob: &[u8]) -> LoadResult<Sandbox> {
        let def = ProgramDef::decode(blob)?;
        self.load_program(&def)
    }

    /// Link an already decoded program
    pub fn load_program(self, def: &ProgramDef) -> LoadResult<Sandbox> {
        self.options.validate()?;
        let program = self.linker().link(def)?;
        for class in program.classes() {
            debug!(class = %class.name, methods = class.methods().len(), "class linked");
        }

        let sandbox = Sandbox(Arc::new(Inner {
            program,
            policy: self.policy,
            object_model: self.object_model,
            options: self.options,
            disabled: AtomicBool::new(false),
            state: ReentrantMutex::new(RefCell::new(EntryState::default())),
        }));
        if self.mode == LoadMode::Run {
            sandbox.run_static_ctors().map_err(|(class, e)| LoadError::Initializer {
                class,
                source: Box::new(e),
            })?;
        }
        info!(
            classes = sandbox.0.program.classes().len(),
            tokens = sandbox.0.program.tokens().len(),
            mode = ?self.mode,
            "program loaded"
        );
        Ok(sandbox)
    }
}

impl Sandbox {
    /// Start configuring a box guarded by `policy`
    pub fn builder(policy: impl SecurityPolicy + 'static) -> SandboxBuilder {
        Self::builder_with(Arc::new(policy))
    }

    /// Start configuring a box guarded by a shared policy
    pub fn builder_with(policy: Arc<dyn SecurityPolicy>) -> SandboxBuilder {
        SandboxBuilder {
            policy,
            natives: NativeRegistry::core_library(),
            shims: ShimTable::new(),
            object_model: Arc::new(EmptyObjectModel),
            options: SandboxOptions::default(),
            mode: LoadMode::Run,
        }
    }

    /// The linked program
    pub fn program(&self) -> &Program {
        &self.0.program
    }

    /// Execution limits
    pub fn options(&self) -> &SandboxOptions {
        &self.0.options
    }

    /// Invoke a static method by class and method name
    pub fn invoke_static(&self, class: &str, method: &str, args: Vec<Value>) -> ExecResult<Option<Value>> {
        let program = &self.0.program;
        let class_index = program
            .find_class(class)
            .ok_or_else(|| ExecError::NotFound(format!("class {}", class)))?;
        let method_index = program
            .class(class_index)
            .and_then(|c| {
                c.methods()
                    .iter()
                    .position(|m| m.is_static && m.name == method)
            })
            .ok_or_else(|| ExecError::NotFound(format!("static method {}::{}", class, method)))?;
        self.run_entry(class_index, method_index, args)
    }

    /// Run one entry into interpreted code
    ///
    /// Refuses to start when the box is disabled. Runtime faults and timeouts
    /// disable the box; script exceptions do not. An enclosing entry stops
    /// with [`ExecError::Disabled`] before its next instruction.
    pub(crate) fn run_entry(&self, class: usize, method: usize, args: Vec<Value>) -> ExecResult<Option<Value>> {
        let inner = &*self.0;
        let guard = inner.state.lock();

        let (mut buffer, mut budget, started, top_level) = {
            let mut state = guard.borrow_mut();
            if inner.disabled.load(Ordering::Acquire) {
                return Err(ExecError::Disabled);
            }
            let now = Instant::now();
            let top_level = state.depth == 0;
            if top_level {
                state.entry_start = Some(now);
            }
            let started = state.entry_start.unwrap_or(now);
            state.depth += 1;
            state.entries += 1;
            let buffer = state
                .buffers
                .pop()
                .unwrap_or_else(|| vec![Value::default(); inner.options.frame_slots]);
            let budget = Budget::new(&inner.options, started, state.frame_used);
            (buffer, budget, started, top_level)
        };

        let result = Interpreter::new(
            &inner.program,
            &*inner.object_model,
            &mut buffer,
            &mut budget,
            &inner.disabled,
            inner.options.max_call_depth,
        )
        .invoke(class, method, args);

        let mut state = guard.borrow_mut();
        state.depth -= 1;
        state.instructions += budget.instructions;
        if top_level {
            let elapsed = started.elapsed();
            state.frame_used += elapsed;
            state.total_used += elapsed;
            state.entry_start = None;
        }
        for slot in buffer.iter_mut() {
            *slot = Value::default();
        }
        state.buffers.push(buffer);

        if let Err(e) = &result {
            let name = self.method_name(class, method);
            match e {
                ExecError::Timeout { elapsed, budget } => {
                    warn!(method = %name, ?elapsed, ?budget, "entry timed out; box disabled");
                }
                ExecError::Runtime {
                    class,
                    method,
                    offset,
                    kind,
                } => {
                    error!(%class, %method, offset, error = %kind, "runtime fault; box disabled");
                }
                other => debug!(method = %name, error = %other, "entry failed"),
            }
            if e.disables() {
                inner.disabled.store(true, Ordering::Release);
                state.faults += 1;
            }
        }
        result
    }

    fn method_name(&self, class: usize, method: usize) -> String {
        let program = &self.0.program;
        match program.class(class) {
            Some(c) => format!("{}::{}", c.name, c.method(method).map_or("?", |m| m.name.as_str())),
            None => "?".to_string(),
        }
    }

    fn run_static_ctors(&self) -> Result<(), (String, ExecError)> {
        for (index, class) in self.0.program.classes().iter().enumerate() {
            if let Some(cctor) = class.static_ctor() {
                self.run_entry(index, cctor, Vec::new())
                    .map_err(|e| (class.name.to_string(), e))?;
            }
        }
        Ok(())
    }

    /// Start a new host frame: the time budget is measured from here
    pub fn reset_frame_budget(&self) {
        let guard = self.0.state.lock();
        guard.borrow_mut().frame_used = Duration::ZERO;
    }

    /// Re-enable the box and restore its program to the just-loaded state
    ///
    /// Static fields return to their declared initial values and static
    /// constructors run again. Existing proxies keep their field values.
    pub fn reinitialize(&self) -> ExecResult<()> {
        let guard = self.0.state.lock();
        {
            let mut state = guard.borrow_mut();
            if state.depth > 0 {
                return Err(ExecError::InvalidArguments(
                    "cannot reinitialize from inside an entry".to_string(),
                ));
            }
            self.0.disabled.store(false, Ordering::Release);
            state.frame_used = Duration::ZERO;
        }
        for class in self.0.program.classes() {
            class.reset_statics();
        }
        self.run_static_ctors().map_err(|(_, e)| e)?;
        info!(classes = self.0.program.classes().len(), "box reinitialized");
        Ok(())
    }

    /// Whether a fault or timeout has disabled the box
    pub fn is_disabled(&self) -> bool {
        self.0.disabled.load(Ordering::Acquire)
    }

    /// Snapshot of the execution counters
    pub fn stats(&self) -> SandboxStats {
        let guard = self.0.state.lock();
        let state = guard.borrow();
        let running = state.entry_start.map_or(Duration::ZERO, |start| start.elapsed());
        SandboxStats {
            entries: state.entries,
            instructions: state.instructions,
            faults: state.faults,
            frame_elapsed: state.frame_used + running,
            total_elapsed: state.total_used + running,
            depth: state.depth,
            disabled: self.0.disabled.load(Ordering::Acquire),
        }
    }
}
