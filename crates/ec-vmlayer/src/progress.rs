use std::sync::Arc;

/// Coarse progress reported to whoever is watching a long-running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// A new phase started ("Creating VMs").
    Task,
    /// Incremental progress inside the current phase ("2 of 4 nodes active").
    Step,
}

pub type UpdateCallback = Arc<dyn Fn(UpdateKind, &str) + Send + Sync>;

/// Callback that drops every update.
pub fn noop() -> UpdateCallback {
    Arc::new(|_, _| {})
}

/// Callback that logs each update against `subject`.
pub fn logging(subject: impl Into<String>) -> UpdateCallback {
    let subject = subject.into();
    Arc::new(move |kind, msg| match kind {
        UpdateKind::Task => tracing::info!(subject = %subject, "{msg}"),
        UpdateKind::Step => tracing::debug!(subject = %subject, "{msg}"),
    })
}

/// Numbered task reporter: "Creating VMs (2/5)".
pub struct TaskCounter {
    callback: UpdateCallback,
    total: usize,
    current: usize,
}

impl TaskCounter {
    pub fn new(callback: UpdateCallback, total: usize) -> Self {
        Self {
            callback,
            total,
            current: 0,
        }
    }

    pub fn task(&mut self, msg: &str) {
        self.current += 1;
        (self.callback)(
            UpdateKind::Task,
            &format!("{msg} ({}/{})", self.current, self.total),
        );
    }

    pub fn step(&self, msg: &str) {
        (self.callback)(UpdateKind::Step, msg);
    }

    /// The underlying callback, for handing to a sub-operation.
    pub fn callback(&self) -> UpdateCallback {
        self.callback.clone()
    }
}
