//! Session controller: owns the transient state and wires user actions to
//! acquisition, inference, the results table and report export.
//!
//! ```text
//! Idle --open--> ImageLoaded --analyze--> Analyzing --ok--> ResultShown
//!                     ^                       |                  |
//!                     +-------- error --------+                  |
//!                     +------------------ open ------------------+
//! any --reset--> Idle
//! ```

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::acquire::{self, UploadedImage};
use crate::config::ReportConfig;
use crate::credential::CredentialStore;
use crate::error::{AppError, Result};
use crate::inference::{self, InferenceBackend};
use crate::report::{self, ExportedReport};
use crate::table::ResultTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    ImageLoaded,
    Analyzing,
    ResultShown,
}

/// Where the user's attention is; results pull focus, reset returns it to the top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewFocus {
    #[default]
    Top,
    Results,
}

#[derive(Debug, Default)]
pub struct SessionState {
    image: Option<UploadedImage>,
    table: Option<ResultTable>,
    busy: bool,
    settings_open: bool,
    focus: ViewFocus,
}

impl SessionState {
    pub fn phase(&self) -> Phase {
        if self.busy {
            Phase::Analyzing
        } else if self.table.is_some() {
            Phase::ResultShown
        } else if self.image.is_some() {
            Phase::ImageLoaded
        } else {
            Phase::Idle
        }
    }

    pub fn image(&self) -> Option<&UploadedImage> {
        self.image.as_ref()
    }

    pub fn table(&self) -> Option<&ResultTable> {
        self.table.as_ref()
    }

    /// Whether the key settings should be shown to the user.
    pub fn settings_open(&self) -> bool {
        self.settings_open
    }

    pub fn focus(&self) -> ViewFocus {
        self.focus
    }
}

/// Holds the busy flag up until dropped, including when the analysis future is cancelled.
struct BusyGuard<'a>(&'a mut bool);

impl<'a> BusyGuard<'a> {
    fn engage(flag: &'a mut bool) -> Self {
        *flag = true;
        Self(flag)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        *self.0 = false;
    }
}

pub struct SessionController<S, B> {
    store: S,
    backend: B,
    report: ReportConfig,
    out_dir: PathBuf,
    state: SessionState,
}

impl<S: CredentialStore, B: InferenceBackend> SessionController<S, B> {
    pub fn new(store: S, backend: B, report: ReportConfig, out_dir: PathBuf) -> Self {
        let state = SessionState {
            settings_open: !store.has_credential(),
            ..SessionState::default()
        };
        Self {
            store,
            backend,
            report,
            out_dir,
            state,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn has_credential(&self) -> bool {
        self.store.has_credential()
    }

    /// Persist the key; a successful save closes the settings.
    pub fn save_key(&mut self, token: &str) -> Result<()> {
        self.store.save(token)?;
        self.state.settings_open = false;
        Ok(())
    }

    /// Load the first file of `selection`. A new image hides any previous result.
    pub async fn choose_file(&mut self, selection: &[PathBuf]) -> Result<Phase> {
        if self.state.busy {
            return Err(AppError::Busy);
        }
        if let Some(image) = acquire::acquire(selection).await? {
            self.state.image = Some(image);
            self.state.table = None;
            self.state.focus = ViewFocus::Top;
        }
        Ok(self.phase())
    }

    /// Send the current image for analysis and show the result.
    ///
    /// Fails fast with [`AppError::MissingCredential`] (opening the settings)
    /// when no key is stored. The busy flag is cleared whatever the outcome.
    pub async fn analyze(&mut self) -> Result<&ResultTable> {
        if self.state.busy {
            return Err(AppError::Busy);
        }
        let Some(api_key) = self.store.load() else {
            self.state.settings_open = true;
            return Err(AppError::MissingCredential);
        };
        if self.state.image.is_none() {
            return Err(AppError::NoImage);
        }

        self.state.table = None;
        let outcome = {
            let _busy = BusyGuard::engage(&mut self.state.busy);
            inference::analyze(&self.backend, self.state.image.as_ref(), Some(&api_key)).await
        };

        let report = outcome?;
        self.state.table = Some(ResultTable::render(&report));
        self.state.focus = ViewFocus::Results;
        self.state.table.as_ref().ok_or(AppError::NoReport)
    }

    /// Edit the label of row `index` (zero-based) of the shown result.
    pub fn rename(&mut self, index: usize, label: &str) -> Result<()> {
        self.state
            .table
            .as_mut()
            .ok_or(AppError::NoReport)?
            .set_label(index, label)
    }

    pub fn download(&self) -> Result<ExportedReport> {
        let table = self.state.table.as_ref().ok_or(AppError::NoReport)?;
        report::download(self.state.image.as_ref(), table, &self.report, &self.out_dir)
    }

    pub fn reset(&mut self) {
        self.state = SessionState {
            settings_open: self.state.settings_open,
            ..SessionState::default()
        };
        tracing::debug!("session reset");
    }
}
