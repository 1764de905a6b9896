use crate::backend::{Backend, HttpBackend};
use crate::cli::{Cli, Command, ScoreAction};
use crate::config::{load_settings, project_paths, save_json_atomic, Settings};
use crate::model::{InvoiceRecord, InvoiceStatus};
use crate::requester::{InvoiceRequester, PurchaseError, PurchaseForm};
use crate::storage::LocalStore;
use crate::tier::{clamp_batches, TierGate};
use crate::ui::{Console, Level};
use crate::watcher::{PaymentWatcher, WatchConfig};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::future::Future;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Owns every service for one run and wires them together.
pub(crate) struct App {
    settings: Settings,
    settings_path: PathBuf,
    download_dir: PathBuf,
    store: Arc<LocalStore>,
    gate: Arc<TierGate>,
    backend: Arc<dyn Backend>,
    requester: InvoiceRequester,
    console: Console,
}

impl App {
    fn init(cli: &Cli) -> Result<Self> {
        let paths = project_paths()?;
        let mut settings = load_settings(&paths.settings_path);
        if let Some(api) = &cli.api {
            settings.api_base = api.clone();
        }
        if let Some(secs) = cli.poll_secs {
            settings.poll_interval_secs = secs;
        }
        let download_dir = settings
            .download_dir
            .clone()
            .unwrap_or(paths.download_dir);

        let store = Arc::new(LocalStore::open(&paths.store_path));
        let backend: Arc<dyn Backend> =
            Arc::new(HttpBackend::new(&settings).context("could not build HTTP client")?);

        Ok(Self::new(
            settings,
            paths.settings_path,
            download_dir,
            store,
            backend,
            cli.link.clone(),
            Console::new(cli.mono),
        ))
    }

    pub(crate) fn new(
        settings: Settings,
        settings_path: PathBuf,
        download_dir: PathBuf,
        store: Arc<LocalStore>,
        backend: Arc<dyn Backend>,
        link: Option<String>,
        console: Console,
    ) -> Self {
        let gate = Arc::new(TierGate::new(store.clone(), None));
        if link.is_some() {
            if let Err(e) = gate.on_link_change(link) {
                tracing::warn!(error = %e, "could not apply launch link score");
            }
        }
        let requester = InvoiceRequester::new(
            backend.clone(),
            gate.clone(),
            store.clone(),
            settings.debounce(),
            settings.failsafe(),
        );
        Self {
            settings,
            settings_path,
            download_dir,
            store,
            gate,
            backend,
            requester,
            console,
        }
    }

    fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            poll_interval: self.settings.poll_interval(),
            ceiling: self.settings.invoice_ceiling(),
        }
    }

    /// Runs one command. Errors that escape a command end up here as a
    /// notice; the process never exits on a raw error.
    pub(crate) async fn dispatch(&self, cmd: Command) -> bool {
        match self.execute(cmd).await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::error!(error = ?e, "command failed");
                self.console.notice(Level::Error, &format!("{e:#}"));
                false
            }
        }
    }

    async fn execute(&self, cmd: Command) -> Result<bool> {
        match cmd {
            Command::Tier => {
                self.console.tier(&self.gate.current());
                Ok(self.gate.purchase_allowed())
            }
            Command::Score { action } => self.score(action),
            Command::Buy {
                invoice,
                batches,
                email,
                out,
                no_watch,
            } => {
                let form = PurchaseForm {
                    rgb_invoice: invoice,
                    batch_count: batches,
                    email,
                };
                self.buy(form, out, !no_watch).await
            }
            Command::Status { invoice_id } => self.status(&invoice_id).await,
            Command::Watch { invoice_id, out } => {
                let Some(id) = invoice_id.or(self.store.snapshot().last_invoice_id) else {
                    self.console.notice(
                        Level::Warn,
                        "No invoice to watch. Create one with `lightcat buy`.",
                    );
                    return Ok(false);
                };
                let record = resumed_record(id, &self.settings);
                self.watch(record, out).await
            }
            Command::Config { save } => {
                println!("{}", serde_json::to_string_pretty(&self.settings)?);
                if save {
                    save_json_atomic(&self.settings_path, &self.settings)?;
                    self.console.notice(
                        Level::Success,
                        &format!("Saved {}", self.settings_path.display()),
                    );
                }
                Ok(true)
            }
        }
    }

    fn score(&self, action: ScoreAction) -> Result<bool> {
        match action {
            ScoreAction::Set { score, session } => {
                self.store.update(|s| {
                    s.score = Some(score.into());
                    if session.is_some() {
                        s.game_session_id = session;
                    }
                })?;
            }
            ScoreAction::Clear => {
                self.store.update(|s| {
                    s.score = None;
                    s.tier = None;
                    s.game_session_id = None;
                })?;
            }
        }
        let st = self.gate.on_storage_change()?;
        self.console.tier(&st);
        Ok(true)
    }

    async fn buy(&self, form: PurchaseForm, out: Option<PathBuf>, watch: bool) -> Result<bool> {
        let st = self.gate.current();
        self.console.tier(&st);

        let record = match self.purchase(form).await {
            Ok(rec) => rec,
            Err(e) => {
                let level = match e {
                    PurchaseError::Busy | PurchaseError::Duplicate => Level::Warn,
                    _ => Level::Error,
                };
                self.console.notice(level, &e.user_message());
                return Ok(false);
            }
        };

        self.console.notice(Level::Success, "Invoice created. Pay it from any Lightning wallet:");
        self.console.invoice(&record);
        if !watch {
            return Ok(true);
        }
        self.watch(record, out).await
    }

    /// Submit a populated form. The store is re-read first; if the tier moved
    /// since the form was filled in, the batch count is clamped to the new
    /// ceiling before anything is sent.
    pub(crate) async fn purchase(
        &self,
        mut form: PurchaseForm,
    ) -> Result<InvoiceRecord, PurchaseError> {
        let mut tier = self.gate.subscribe();
        if let Err(e) = self.gate.on_storage_change() {
            tracing::warn!(error = %e, "could not refresh tier before submit");
        }
        if tier.has_changed().unwrap_or(false) {
            let now = *tier.borrow_and_update();
            if now.unlocked() && form.batch_count > now.max_batches {
                let clamped = clamp_batches(form.batch_count, &now);
                tracing::info!(
                    from = form.batch_count,
                    to = clamped,
                    tier = %now.tier,
                    "re-clamped batch count"
                );
                self.console.notice(
                    Level::Warn,
                    &format!("Your tier is now {}; batch count reduced to {clamped}.", now.tier),
                );
                form.batch_count = clamped;
            }
        }

        let mut control = self.requester.control();
        let submit = self.requester.submit(&form);
        tokio::pin!(submit);
        loop {
            tokio::select! {
                res = &mut submit => return res,
                changed = control.changed() => {
                    if changed.is_err() {
                        return submit.await;
                    }
                    let c = *control.borrow_and_update();
                    if !c.enabled {
                        self.console.control(&c);
                    }
                }
            }
        }
    }

    async fn status(&self, invoice_id: &str) -> Result<bool> {
        match self.backend.invoice_status(invoice_id).await {
            Ok(s) => {
                let level = match s {
                    InvoiceStatus::Pending => Level::Info,
                    InvoiceStatus::Paid | InvoiceStatus::Delivered => Level::Success,
                    InvoiceStatus::Expired | InvoiceStatus::Failed => Level::Error,
                };
                self.console.notice(level, &format!("Invoice {invoice_id}: {s}"));
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(invoice_id, error = %e, "status check failed");
                self.console
                    .notice(Level::Error, "Could not reach the payment server. Please try again.");
                Ok(false)
            }
        }
    }

    async fn watch(&self, record: InvoiceRecord, out: Option<PathBuf>) -> Result<bool> {
        let stop = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "no Ctrl-C handler; watch runs to completion");
                std::future::pending::<()>().await;
            }
        };
        self.watch_until(record, out, stop).await
    }

    /// Shows the countdown until the invoice settles or `stop` resolves.
    /// The watcher is closed on every exit path.
    pub(crate) async fn watch_until<F>(
        &self,
        record: InvoiceRecord,
        out: Option<PathBuf>,
        stop: F,
    ) -> Result<bool>
    where
        F: Future<Output = ()>,
    {
        let watcher = PaymentWatcher::start(self.backend.clone(), record, self.watch_config());
        let mut rx = watcher.subscribe();
        self.console.countdown(&watcher.state());
        tokio::pin!(stop);

        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let st = rx.borrow_and_update().clone();
                    self.console.countdown(&st);
                    if !st.active {
                        break;
                    }
                }
                _ = &mut stop => {
                    watcher.close();
                    self.console.end_line();
                    self.console.notice(
                        Level::Info,
                        &format!(
                            "Stopped watching {}. Resume with `lightcat watch`.",
                            watcher.record().invoice_id
                        ),
                    );
                    return Ok(false);
                }
            }
        }
        self.console.end_line();

        match watcher.state().status {
            InvoiceStatus::Paid | InvoiceStatus::Delivered => {
                self.console.notice(Level::Success, "Payment received!");
                let dir = out.unwrap_or_else(|| self.download_dir.clone());
                match watcher.download(&dir).await {
                    Ok(path) => {
                        self.console.notice(
                            Level::Success,
                            &format!("Consignment saved to {}", path.display()),
                        );
                        Ok(true)
                    }
                    Err(e) => {
                        tracing::warn!(error = ?e, "consignment download failed");
                        self.console.notice(
                            Level::Warn,
                            "Paid; the consignment is not ready yet. Retry with `lightcat watch`.",
                        );
                        Ok(false)
                    }
                }
            }
            InvoiceStatus::Expired => {
                self.console
                    .notice(Level::Error, "Invoice expired. Create a new one to try again.");
                Ok(false)
            }
            InvoiceStatus::Failed => {
                self.console
                    .notice(Level::Error, "Payment failed. No funds were taken; please try again.");
                Ok(false)
            }
            InvoiceStatus::Pending => Ok(false),
        }
    }
}

/// A watch resumed from just an id: no amount or payment string is known,
/// and the expiry is bounded by the invoice ceiling.
fn resumed_record(invoice_id: String, settings: &Settings) -> InvoiceRecord {
    let ceiling = chrono::Duration::from_std(settings.invoice_ceiling())
        .unwrap_or_else(|_| chrono::Duration::minutes(15));
    InvoiceRecord {
        invoice_id,
        lightning_invoice: String::new(),
        amount_sats: 0,
        expires_at: Utc::now() + ceiling,
        status: InvoiceStatus::Pending,
        qr_code: None,
    }
}

pub(crate) async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let app = App::init(&cli)?;
    let ok = app.dispatch(cli.command).await;
    Ok(if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::storage::ClientState;
    use serde_json::json;
    use std::time::Duration;

    fn app(score: u32, backend: &Arc<FakeBackend>, name: &str) -> (App, Arc<LocalStore>, PathBuf) {
        let store = Arc::new(LocalStore::in_memory(ClientState {
            score: Some(json!(score)),
            ..Default::default()
        }));
        let dir = std::env::temp_dir()
            .join(format!("lightcat-app-{}-{}", name, std::process::id()));
        let app = App::new(
            Settings::default(),
            dir.join("settings.json"),
            dir.join("consignments"),
            store.clone(),
            backend.clone(),
            None,
            Console::new(true),
        );
        (app, store, dir)
    }

    fn form(batches: u32) -> PurchaseForm {
        PurchaseForm {
            rgb_invoice: "rgb1abcdefghijklmnopqrstuvwxyz".into(),
            batch_count: batches,
            email: Some("cat@rgblightcat.com".into()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gold_purchase_runs_to_a_single_download() {
        let backend = Arc::new(FakeBackend::default());
        backend.push_status(Ok(InvoiceStatus::Pending));
        backend.push_status(Ok(InvoiceStatus::Pending));
        backend.push_status(Ok(InvoiceStatus::Paid));
        let (app, store, dir) = app(25, &backend, "gold");

        let st = app.gate.current();
        assert_eq!((st.tier.label(), st.max_batches), ("gold", 30));

        let record = app.purchase(form(30)).await.unwrap();
        assert_eq!(FakeBackend::count(&backend.creates), 1);
        assert_eq!(store.snapshot().last_invoice_id, Some(record.invoice_id.clone()));

        let ok = app
            .watch_until(record, None, std::future::pending::<()>())
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(FakeBackend::count(&backend.polls), 3);
        assert_eq!(FakeBackend::count(&backend.downloads), 1);
        assert!(dir.join("consignments/lightcat-inv_default.rgb").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn low_score_is_told_to_finish_the_game() {
        let backend = Arc::new(FakeBackend::default());
        let (app, _, _) = app(5, &backend, "locked");
        assert!(!app.gate.purchase_allowed());

        let err = app.purchase(form(1)).await.unwrap_err();
        assert_eq!(err.user_message(), "Complete the game to unlock purchasing.");
        assert_eq!(FakeBackend::count(&backend.creates), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tier_drop_before_submit_reclamps() {
        let backend = Arc::new(FakeBackend::default());
        let (app, store, _) = app(25, &backend, "reclamp");

        // The game rewrites the score after the form was filled in.
        store.update(|s| s.score = Some(json!(12))).unwrap();
        app.purchase(form(30)).await.unwrap();

        let sent = backend.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(sent.batch_count, 10);
        assert_eq!(sent.tier_label, "bronze");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_closes_the_watch() {
        let backend = Arc::new(FakeBackend::default());
        let (app, _, _) = app(25, &backend, "stop");
        let record = resumed_record("inv_stop".into(), &app.settings);

        let ok = app
            .watch_until(record, None, tokio::time::sleep(Duration::from_secs(7)))
            .await
            .unwrap();
        assert!(!ok);
        let polls = FakeBackend::count(&backend.polls);
        assert_eq!(polls, 2);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(FakeBackend::count(&backend.polls), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn score_commands_update_the_gate() {
        let backend = Arc::new(FakeBackend::default());
        let (app, store, _) = app(0, &backend, "score");
        app.score(ScoreAction::Set {
            score: 16,
            session: Some("gs-1".into()),
        })
        .unwrap();
        assert_eq!(app.gate.current().max_batches, 20);
        assert_eq!(store.snapshot().tier.as_deref(), Some("silver"));
        assert_eq!(store.snapshot().game_session_id.as_deref(), Some("gs-1"));

        app.score(ScoreAction::Clear).unwrap();
        assert!(!app.gate.purchase_allowed());
        assert_eq!(store.snapshot(), ClientState::default());
    }
}
