//! Notebook execution model.
//!
//! A [`Notebook`] owns an ordered list of cells and turns the replies of an
//! execute request into cell state: outputs in arrival order, the execution
//! count from a successful reply, and `pending -> running -> done | error`.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use jupyter_wire::{ExecutionState, Message, MessageContent, MimeBundle, ReplyStatus};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::connection::{ExecuteOptions, KernelConnection};
use crate::error::{KernelError, Result};
use crate::future::KernelFuture;
use crate::output::{push_output, Output};
use crate::renderer::{DisplayHandle, RendererRegistry};
use crate::signal::{Signal, Subscription};
use crate::status::KernelStatus;
use crate::store::{DocumentCell, NotebookDocument, NotebookStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

/// Why a cell execution did not complete.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CellError {
    Kernel {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    /// Skipped by the kernel after an earlier cell failed.
    Aborted,
    Interrupted,
    KernelRestarted,
    KernelDied,
    Timeout,
    Shutdown,
    Transport {
        message: String,
    },
    Disposed,
}

impl CellError {
    /// Classify the error a cell's execute request settled with.
    ///
    /// `interrupt_requested` turns kernel errors and client-side cancellation
    /// into [`CellError::Interrupted`].
    pub fn from_kernel_error(err: &KernelError, interrupt_requested: bool) -> Self {
        match err {
            KernelError::Kernel { status, .. } if *status == ReplyStatus::Abort => {
                if interrupt_requested {
                    CellError::Interrupted
                } else {
                    CellError::Aborted
                }
            }
            KernelError::Kernel { .. } | KernelError::Disposed if interrupt_requested => {
                CellError::Interrupted
            }
            KernelError::Kernel {
                ename,
                evalue,
                traceback,
                ..
            } => CellError::Kernel {
                ename: ename.clone(),
                evalue: evalue.clone(),
                traceback: traceback.clone(),
            },
            KernelError::Disposed => CellError::Disposed,
            KernelError::KernelRestarted => CellError::KernelRestarted,
            KernelError::KernelDied | KernelError::KernelDead => CellError::KernelDied,
            KernelError::Timeout(_) => CellError::Timeout,
            KernelError::SessionShutdown => CellError::Shutdown,
            KernelError::Transport(message) => CellError::Transport {
                message: message.clone(),
            },
            KernelError::NotConnected | KernelError::Protocol(_) | KernelError::Provider(_) => {
                CellError::Transport {
                    message: err.to_string(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum CellState {
    Idle,
    Pending,
    Running,
    Done,
    Error(CellError),
}

impl CellState {
    pub fn is_active(&self) -> bool {
        matches!(self, CellState::Pending | CellState::Running)
    }
}

/// Snapshot of one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub id: String,
    pub cell_type: CellType,
    pub source: String,
    pub metadata: Map<String, Value>,
    pub execution_count: Option<u64>,
    pub outputs: Vec<Output>,
    pub state: CellState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotebookEvent {
    CellChanged { cell_id: String },
    BusyChanged(bool),
}

#[derive(Debug, thiserror::Error)]
pub enum NotebookError {
    #[error("no cell with id {0}")]
    UnknownCell(String),

    #[error("cell {0} is not a code cell")]
    NotCode(String),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Run {
    msg_id: String,
    future: KernelFuture,
    interrupt_requested: bool,
}

struct CellSlot {
    cell: Cell,
    run: Option<Run>,
    /// `clear_output(wait=true)` seen; clear before the next output.
    clear_pending: bool,
    /// Parallel to `cell.outputs`.
    handles: Vec<Option<Box<dyn DisplayHandle>>>,
}

impl CellSlot {
    fn new(cell: Cell) -> Self {
        let handles = cell.outputs.iter().map(|_| None).collect();
        Self {
            cell,
            run: None,
            clear_pending: false,
            handles,
        }
    }

    fn clear_outputs(&mut self) {
        for handle in self.handles.iter_mut().flatten() {
            handle.dispose();
        }
        self.handles.clear();
        self.cell.outputs.clear();
        self.clear_pending = false;
    }

    fn append(&mut self, output: Output, renderer: Option<&dyn RendererRegistry>) {
        if self.clear_pending {
            self.clear_outputs();
        }
        let index = push_output(&mut self.cell.outputs, output);
        if index == self.handles.len() {
            let handle = renderer.and_then(|r| render(r, self.cell.outputs[index].data()?));
            self.handles.push(handle);
        }
    }

    fn is_running(&self, msg_id: &str) -> bool {
        self.run.as_ref().is_some_and(|run| run.msg_id == msg_id)
    }
}

fn render(renderer: &dyn RendererRegistry, data: &MimeBundle) -> Option<Box<dyn DisplayHandle>> {
    renderer.can_render(data).then(|| renderer.render(data))
}

struct NotebookState {
    cells: Vec<CellSlot>,
    metadata: Map<String, Value>,
    kernel_status: KernelStatus,
    renderer: Option<Arc<dyn RendererRegistry>>,
    dirty: bool,
}

impl NotebookState {
    fn slot(&mut self, cell_id: &str) -> std::result::Result<&mut CellSlot, NotebookError> {
        self.cells
            .iter_mut()
            .find(|slot| slot.cell.id == cell_id)
            .ok_or_else(|| NotebookError::UnknownCell(cell_id.to_string()))
    }

    fn update_display(&mut self, display_id: &str, data: &MimeBundle, metadata: &Map<String, Value>) {
        let renderer = self.renderer.clone();
        let mut updated = 0;
        for slot in self.cells.iter_mut() {
            for (output, handle) in slot.cell.outputs.iter_mut().zip(slot.handles.iter_mut()) {
                if output.display_id() != Some(display_id) {
                    continue;
                }
                output.update_display(data, metadata);
                if let Some(mut old) = handle.take() {
                    old.dispose();
                }
                *handle = renderer.as_deref().and_then(|r| render(r, data));
                updated += 1;
            }
        }
        debug!("[notebook] Updated {} outputs for display {}", updated, display_id);
    }
}

struct NotebookShared {
    state: StdMutex<NotebookState>,
    changed: Signal<NotebookEvent>,
}

/// Cells plus the execution state derived from kernel replies.
#[derive(Clone)]
pub struct Notebook {
    shared: Arc<NotebookShared>,
}

impl Default for Notebook {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Notebook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Notebook")
            .field("cells", &state.cells.len())
            .field("kernel_status", &state.kernel_status)
            .field("dirty", &state.dirty)
            .finish()
    }
}

impl Notebook {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(NotebookShared {
                state: StdMutex::new(NotebookState {
                    cells: Vec::new(),
                    metadata: Map::new(),
                    kernel_status: KernelStatus::Unknown,
                    renderer: None,
                    dirty: false,
                }),
                changed: Signal::new(),
            }),
        }
    }

    /// Render rich outputs through `renderer` from now on.
    pub fn set_renderer(&self, renderer: Arc<dyn RendererRegistry>) {
        self.lock().renderer = Some(renderer);
    }

    pub fn add_cell(&self, cell_type: CellType, source: impl Into<String>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.lock();
            state.cells.push(CellSlot::new(Cell {
                id: id.clone(),
                cell_type,
                source: source.into(),
                metadata: Map::new(),
                execution_count: None,
                outputs: Vec::new(),
                state: CellState::Idle,
            }));
            state.dirty = true;
        }
        self.emit_cell(&id);
        id
    }

    /// Remove a cell. A running execution keeps going in the kernel but its
    /// replies are no longer tracked.
    pub fn remove_cell(&self, cell_id: &str) -> std::result::Result<Cell, NotebookError> {
        let mut slot = {
            let mut state = self.lock();
            let index = state
                .cells
                .iter()
                .position(|slot| slot.cell.id == cell_id)
                .ok_or_else(|| NotebookError::UnknownCell(cell_id.to_string()))?;
            state.dirty = true;
            state.cells.remove(index)
        };
        for handle in slot.handles.iter_mut().flatten() {
            handle.dispose();
        }
        let run = slot.run.take();
        if let Some(run) = run {
            run.future.dispose();
        }
        self.emit_cell(cell_id);
        Ok(slot.cell)
    }

    pub fn set_source(
        &self,
        cell_id: &str,
        source: impl Into<String>,
    ) -> std::result::Result<(), NotebookError> {
        {
            let mut state = self.lock();
            state.slot(cell_id)?.cell.source = source.into();
            state.dirty = true;
        }
        self.emit_cell(cell_id);
        Ok(())
    }

    pub fn cell(&self, cell_id: &str) -> Option<Cell> {
        self.lock()
            .cells
            .iter()
            .find(|slot| slot.cell.id == cell_id)
            .map(|slot| slot.cell.clone())
    }

    pub fn cells(&self) -> Vec<Cell> {
        self.lock().cells.iter().map(|slot| slot.cell.clone()).collect()
    }

    pub fn cell_ids(&self) -> Vec<String> {
        self.lock().cells.iter().map(|slot| slot.cell.id.clone()).collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    pub fn mark_clean(&self) {
        self.lock().dirty = false;
    }

    pub fn kernel_status(&self) -> KernelStatus {
        self.lock().kernel_status
    }

    /// True while the kernel reports `busy`.
    pub fn is_busy(&self) -> bool {
        self.kernel_status() == KernelStatus::Busy
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&NotebookEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.changed.subscribe(listener)
    }

    /// A status listener to hand to `Session::subscribe_status` or
    /// `KernelConnection::subscribe_status`. It holds the notebook weakly.
    pub fn status_listener(&self) -> impl Fn(&KernelStatus) + Send + Sync + 'static {
        let weak = Arc::downgrade(&self.shared);
        move |status| {
            if let Some(shared) = weak.upgrade() {
                Notebook { shared }.set_kernel_status(*status);
            }
        }
    }

    pub fn set_kernel_status(&self, status: KernelStatus) {
        let (was_busy, is_busy) = {
            let mut state = self.lock();
            let was_busy = state.kernel_status == KernelStatus::Busy;
            state.kernel_status = status;
            (was_busy, status == KernelStatus::Busy)
        };
        if was_busy != is_busy {
            self.shared.changed.emit(&NotebookEvent::BusyChanged(is_busy));
        }
    }

    /// Run a code cell. Its outputs are cleared and replaced by whatever the
    /// execution produces.
    pub fn execute_cell(
        &self,
        cell_id: &str,
        connection: &KernelConnection,
    ) -> std::result::Result<KernelFuture, NotebookError> {
        let source = {
            let mut state = self.lock();
            let slot = state.slot(cell_id)?;
            if slot.cell.cell_type != CellType::Code {
                return Err(NotebookError::NotCode(cell_id.to_string()));
            }
            slot.cell.source.clone()
        };

        let future = connection.request_execute(&source, ExecuteOptions::default());
        let msg_id = future.msg_id().to_string();
        {
            let mut state = self.lock();
            state.dirty = true;
            let slot = state.slot(cell_id)?;
            slot.clear_outputs();
            slot.cell.state = CellState::Pending;
            slot.run = Some(Run {
                msg_id: msg_id.clone(),
                future: future.clone(),
                interrupt_requested: false,
            });
        }
        debug!("[notebook] Cell {} executing as {}", cell_id, msg_id);
        self.emit_cell(cell_id);

        let weak = Arc::downgrade(&self.shared);
        let (id, msg) = (cell_id.to_string(), msg_id.clone());
        future.on_any(move |message| {
            if let Some(notebook) = upgrade(&weak) {
                notebook.apply_reply(&id, &msg, message);
            }
        });

        let weak = Arc::downgrade(&self.shared);
        let id = cell_id.to_string();
        future.on_done(move |result| {
            if let Some(notebook) = upgrade(&weak) {
                notebook.finish_run(&id, &msg_id, result);
            }
        });

        Ok(future)
    }

    /// Execute every code cell in order. The kernel queues them.
    pub fn execute_all(
        &self,
        connection: &KernelConnection,
    ) -> std::result::Result<Vec<KernelFuture>, NotebookError> {
        let code_cells: Vec<String> = self
            .lock()
            .cells
            .iter()
            .filter(|slot| slot.cell.cell_type == CellType::Code)
            .map(|slot| slot.cell.id.clone())
            .collect();
        code_cells
            .iter()
            .map(|id| self.execute_cell(id, connection))
            .collect()
    }

    /// Interrupt a running cell through the kernel's control channel.
    ///
    /// Partial outputs stay; the cell ends as `Error(Interrupted)` once the
    /// kernel replies. Returns `None` if the cell was not running.
    pub fn interrupt_cell(
        &self,
        cell_id: &str,
        connection: &KernelConnection,
    ) -> std::result::Result<Option<KernelFuture>, NotebookError> {
        if !self.flag_interrupt(cell_id)? {
            return Ok(None);
        }
        info!("[notebook] Interrupting cell {}", cell_id);
        Ok(Some(connection.interrupt()))
    }

    /// Stop tracking a running cell without telling the kernel.
    ///
    /// Partial outputs stay and the cell ends as `Error(Interrupted)`.
    pub fn cancel_cell(&self, cell_id: &str) -> std::result::Result<bool, NotebookError> {
        if !self.flag_interrupt(cell_id)? {
            return Ok(false);
        }
        let future = self
            .lock()
            .slot(cell_id)?
            .run
            .as_ref()
            .map(|run| run.future.clone());
        if let Some(future) = future {
            future.dispose();
        }
        Ok(true)
    }

    pub fn clear_outputs(&self, cell_id: &str) -> std::result::Result<(), NotebookError> {
        {
            let mut state = self.lock();
            state.slot(cell_id)?.clear_outputs();
            state.dirty = true;
        }
        self.emit_cell(cell_id);
        Ok(())
    }

    pub fn to_document(&self) -> NotebookDocument {
        let state = self.lock();
        let cells = state
            .cells
            .iter()
            .map(|slot| {
                let cell = &slot.cell;
                match cell.cell_type {
                    CellType::Code => DocumentCell::Code {
                        id: cell.id.clone(),
                        source: cell.source.clone(),
                        metadata: cell.metadata.clone(),
                        execution_count: cell.execution_count,
                        outputs: cell.outputs.clone(),
                    },
                    CellType::Markdown => DocumentCell::Markdown {
                        id: cell.id.clone(),
                        source: cell.source.clone(),
                        metadata: cell.metadata.clone(),
                    },
                    CellType::Raw => DocumentCell::Raw {
                        id: cell.id.clone(),
                        source: cell.source.clone(),
                        metadata: cell.metadata.clone(),
                    },
                }
            })
            .collect();
        NotebookDocument {
            cells,
            metadata: state.metadata.clone(),
            ..Default::default()
        }
    }

    pub fn from_document(document: NotebookDocument) -> Self {
        let notebook = Self::new();
        {
            let mut state = notebook.lock();
            state.metadata = document.metadata;
            state.cells = document
                .cells
                .into_iter()
                .map(|cell| {
                    let cell = match cell {
                        DocumentCell::Code {
                            id,
                            source,
                            metadata,
                            execution_count,
                            outputs,
                        } => Cell {
                            id,
                            cell_type: CellType::Code,
                            source,
                            metadata,
                            execution_count,
                            outputs,
                            state: CellState::Idle,
                        },
                        DocumentCell::Markdown {
                            id,
                            source,
                            metadata,
                        } => text_cell(id, CellType::Markdown, source, metadata),
                        DocumentCell::Raw {
                            id,
                            source,
                            metadata,
                        } => text_cell(id, CellType::Raw, source, metadata),
                    };
                    CellSlot::new(cell)
                })
                .collect();
        }
        notebook
    }

    pub fn save(
        &self,
        store: &dyn NotebookStore,
        path: &Path,
    ) -> std::result::Result<(), NotebookError> {
        store.save(path, &self.to_document())?;
        self.mark_clean();
        Ok(())
    }

    pub fn load(store: &dyn NotebookStore, path: &Path) -> std::result::Result<Self, NotebookError> {
        let document = store.load(path)?;
        info!("[notebook] Loaded {} cells from {}", document.cells.len(), path.display());
        Ok(Self::from_document(document))
    }

    fn flag_interrupt(&self, cell_id: &str) -> std::result::Result<bool, NotebookError> {
        let mut state = self.lock();
        let slot = state.slot(cell_id)?;
        match slot.run.as_mut() {
            Some(run) if slot.cell.state.is_active() => {
                run.interrupt_requested = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn apply_reply(&self, cell_id: &str, msg_id: &str, message: &Message) {
        {
            let mut state = self.lock();
            let renderer = state.renderer.clone();

            if let MessageContent::UpdateDisplayData(update) = &message.content {
                match update.transient.display_id.as_deref() {
                    Some(display_id) => {
                        state.update_display(display_id, &update.data, &update.metadata)
                    }
                    None => warn!("[notebook] update_display_data without a display_id"),
                }
                drop(state);
                self.emit_cell(cell_id);
                return;
            }

            let Ok(slot) = state.slot(cell_id) else {
                return;
            };
            if !slot.is_running(msg_id) {
                return;
            }

            match &message.content {
                MessageContent::Status(status) => {
                    if status.execution_state == ExecutionState::Busy
                        && slot.cell.state == CellState::Pending
                    {
                        slot.cell.state = CellState::Running;
                    }
                }
                MessageContent::ExecuteInput(_) => {
                    if slot.cell.state == CellState::Pending {
                        slot.cell.state = CellState::Running;
                    }
                }
                MessageContent::ClearOutput(clear) => {
                    if clear.wait {
                        slot.clear_pending = true;
                    } else {
                        slot.clear_outputs();
                    }
                }
                content => match Output::from_content(content) {
                    Some(output) => slot.append(output, renderer.as_deref()),
                    None => return,
                },
            }
        }
        self.emit_cell(cell_id);
    }

    fn finish_run(&self, cell_id: &str, msg_id: &str, result: &Result<Message>) {
        {
            let mut state = self.lock();
            let renderer = state.renderer.clone();
            let Ok(slot) = state.slot(cell_id) else {
                return;
            };
            if !slot.is_running(msg_id) {
                return;
            }
            let interrupt_requested = slot
                .run
                .take()
                .map(|run| run.interrupt_requested)
                .unwrap_or(false);
            slot.clear_pending = false;

            match result {
                Ok(reply) => {
                    if let MessageContent::ExecuteReply(reply) = &reply.content {
                        if let Some(count) = reply.execution_count {
                            slot.cell.execution_count = Some(count);
                        }
                        for output in reply.payload.iter().filter_map(Output::from_page_payload) {
                            slot.append(output, renderer.as_deref());
                        }
                    }
                    slot.cell.state = CellState::Done;
                }
                Err(err) => {
                    let error = CellError::from_kernel_error(err, interrupt_requested);
                    debug!("[notebook] Cell {} failed: {:?}", cell_id, error);
                    slot.cell.state = CellState::Error(error);
                }
            }
        }
        self.emit_cell(cell_id);
    }

    fn emit_cell(&self, cell_id: &str) {
        self.shared.changed.emit(&NotebookEvent::CellChanged {
            cell_id: cell_id.to_string(),
        });
    }

    fn lock(&self) -> MutexGuard<'_, NotebookState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn upgrade(weak: &Weak<NotebookShared>) -> Option<Notebook> {
    weak.upgrade().map(|shared| Notebook { shared })
}

fn text_cell(id: String, cell_type: CellType, source: String, metadata: Map<String, Value>) -> Cell {
    Cell {
        id,
        cell_type,
        source,
        metadata,
        execution_count: None,
        outputs: Vec::new(),
        state: CellState::Idle,
    }
}
