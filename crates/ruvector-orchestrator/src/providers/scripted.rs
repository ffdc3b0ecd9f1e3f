//! Scripted processor for orchestration tests

use anyhow::bail;
use parking_lot::{Condvar, Mutex};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{DocumentProcessor, PageContent};

/// One-shot gate a worker thread parks on until the test opens it
#[derive(Default)]
pub struct Latch {
    state: Mutex<LatchState>,
    cv: Condvar,
}

#[derive(Default)]
struct LatchState {
    entered: bool,
    open: bool,
}

impl Latch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn wait(&self) {
        let mut state = self.state.lock();
        state.entered = true;
        while !state.open {
            self.cv.wait(&mut state);
        }
    }

    pub fn open(&self) {
        self.state.lock().open = true;
        self.cv.notify_all();
    }

    /// Has a worker reached the latch?
    pub fn is_entered(&self) -> bool {
        self.state.lock().entered
    }

    pub async fn wait_entered(&self) {
        for _ in 0..1000 {
            if self.is_entered() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no worker reached the latch");
    }
}

/// Processor with fixed page counts, optional delays, injected failures
/// and latches that hold page 1 of a given file.
pub struct ScriptedProcessor {
    pages: u32,
    delay: Duration,
    fail_on: Option<(String, u32)>,
    hold: Option<(String, Arc<Latch>)>,
    started: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl ScriptedProcessor {
    pub fn new(pages: u32) -> Self {
        Self {
            pages,
            delay: Duration::ZERO,
            fail_on: None,
            hold: None,
            started: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail OCR of `page` for files named `file`
    pub fn failing_on(mut self, file: &str, page: u32) -> Self {
        self.fail_on = Some((file.to_string(), page));
        self
    }

    /// Park OCR of page 1 of `file` on `latch`
    pub fn holding(mut self, file: &str, latch: Arc<Latch>) -> Self {
        self.hold = Some((file.to_string(), latch));
        self
    }

    /// File names, in the order processing started
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    /// Most OCR calls ever in progress at once
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    fn file_name(source: &Path) -> String {
        source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl DocumentProcessor for ScriptedProcessor {
    fn name(&self) -> &str {
        "scripted"
    }

    fn page_count(&self, source: &Path) -> anyhow::Result<u32> {
        self.started.lock().push(Self::file_name(source));
        Ok(self.pages)
    }

    fn ocr_page(&self, source: &Path, page: u32) -> anyhow::Result<PageContent> {
        let name = Self::file_name(source);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);

        if page == 1 {
            if let Some((file, latch)) = &self.hold {
                if *file == name {
                    latch.wait();
                }
            }
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if let Some((file, fail_page)) = &self.fail_on {
            if *file == name && *fail_page == page {
                bail!("injected failure on {} page {}", name, page);
            }
        }

        Ok(PageContent {
            page_number: page,
            text: format!("{} page {}", name, page),
        })
    }

    fn refine_page(&self, _source: &Path, content: PageContent) -> anyhow::Result<PageContent> {
        Ok(content)
    }

    fn index_page(&self, _source: &Path, _content: &PageContent) -> anyhow::Result<()> {
        Ok(())
    }
}
