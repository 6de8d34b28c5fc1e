//! Main application logic: a scripted board session driven through the core.
//!
//! The session mounts two instances of the board slice (an editor and a
//! sidebar), seeds them with normalised cards, moves cards through the batch
//! scheduler, reconciles two independently owned copies through the state
//! synchroniser, and finally pages, compresses and exports what happened.

use crate::{cli::CliArgs, config::AppConfig, logging::display_banner};
use anyhow::{ensure, Context};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use statehub_core::events::StateSyncConflict;
use statehub_core::middleware::register_builtin_middleware;
use statehub_core::utils::system_clock;
use statehub_core::{
    async_trait, BatchScheduler, ConflictChoice, DebugEntryType, DebugFilter, DebugRecorder, Event, EventBus, LazyLoader,
    LazyOptions, LoadError, MemorySessionStorage, Memoizer, MiddlewareManager, NormalizedState, PageSource,
    Priority, SelectorOptions, SessionStorage, SliceOptions, StateCompressor, StateSlice, StateSynchronizer,
    SyncOptions,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub title: String,
    pub column: String,
    pub points: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardState {
    pub title: String,
    pub cards: Vec<Card>,
    pub selected: Option<String>,
}

impl BoardState {
    fn empty(title: &str) -> Self {
        Self {
            title: title.to_string(),
            cards: Vec::new(),
            selected: None,
        }
    }

    fn column_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for card in &self.cards {
            *counts.entry(card.column.clone()).or_insert(0) += 1;
        }
        counts
    }

    fn points_in(&self, column: &str) -> u32 {
        self.cards
            .iter()
            .filter(|card| card.column == column)
            .map(|card| card.points)
            .sum()
    }

    /// Patch moving `card_id` to `column`.
    fn move_card(&self, card_id: &str, column: &str) -> Value {
        let cards: Vec<Card> = self
            .cards
            .iter()
            .map(|card| {
                let mut card = card.clone();
                if card.id == card_id {
                    card.column = column.to_string();
                }
                card
            })
            .collect();
        json!({ "cards": cards })
    }
}

/// Outcome of one scripted session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionReport {
    pub cards: usize,
    pub slices_converged: bool,
    pub copies_converged: bool,
    pub batch_updates_applied: usize,
    pub memo_hits: u64,
    pub conflicts_raised: usize,
    pub pages_loaded: usize,
    pub compression_ratio: f64,
    pub events_emitted: u64,
    pub handler_failures: u64,
    pub debug_entries: usize,
    pub export_path: Option<PathBuf>,
}

/// Paged view over the seeded cards.
struct CardPages {
    cards: Vec<Card>,
}

#[async_trait]
impl PageSource<Card> for CardPages {
    async fn fetch_page(&self, page: usize, page_size: usize) -> Result<Vec<Card>, LoadError> {
        Ok(self
            .cards
            .iter()
            .skip(page * page_size)
            .take(page_size)
            .cloned()
            .collect())
    }
}

/// One independently owned copy of the board kept in step by a synchroniser.
struct BoardCopy {
    state: Arc<RwLock<BoardState>>,
    sync: StateSynchronizer<BoardState>,
}

impl BoardCopy {
    fn attach(bus: &EventBus, initial: BoardState, options: SyncOptions) -> Self {
        let state = Arc::new(RwLock::new(initial));
        let reader = state.clone();
        let writer = state.clone();
        let sync = StateSynchronizer::attach(
            bus,
            move || reader.read().clone(),
            move |next: BoardState, _source: &str| *writer.write() = next,
            options,
        );
        Self { state, sync }
    }

    fn snapshot(&self) -> BoardState {
        self.state.read().clone()
    }
}

pub struct Application {
    config: AppConfig,
    export: bool,
}

impl Application {
    /// Loads configuration, applies command-line overrides and validates the result.
    pub async fn new(args: CliArgs) -> anyhow::Result<Self> {
        info!("🔧 Loading configuration from: {}", args.config_path.display());
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }
        if let Some(export_dir) = args.export_dir {
            config.debug.export_dir = export_dir;
        }
        if args.no_export {
            config.debug.export_on_exit = false;
        }

        display_banner();
        Self::from_config(config)
    }

    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        config.validate().context("Configuration validation failed")?;
        info!("✅ Configuration loaded and validated successfully");
        let export = config.debug.enabled && config.debug.export_on_exit;
        Ok(Self { config, export })
    }

    pub async fn run(self) -> anyhow::Result<SessionReport> {
        info!("🌟 Starting statehub session");
        self.log_configuration_summary();
        let config = &self.config;
        let session = &config.session;

        let bus = EventBus::with_options(config.bus.history_capacity, system_clock());
        let middleware = MiddlewareManager::new();
        register_builtin_middleware(&middleware);
        middleware.install_on(&bus);

        let recorder = config
            .debug
            .enabled
            .then(|| DebugRecorder::attach(&bus, config.debug_config()));

        // Slices
        let storage: Arc<dyn SessionStorage> = Arc::new(MemorySessionStorage::new());
        let slice_options = || {
            SliceOptions::new(session.slice_id.clone(), BoardState::empty("Sprint"))
                .persisted(session.persist_to_session)
                .debug(config.debug.enabled)
        };
        let editor = Arc::new(StateSlice::mount(&bus, slice_options(), Some(storage.clone())));
        let sidebar = StateSlice::mount(&bus, slice_options(), Some(storage.clone()));

        let seed = seed_cards(session.card_count, &session.columns[0]);
        let normalized = NormalizedState::normalize(&seed, "id")?;
        let normalized = normalized.update_entity(&seed[0].id, &json!({"points": 8}))?;
        let cards = normalized.denormalize();
        editor.update_state(json!({ "cards": cards }), Some("seed"))?;

        let mut counts = sidebar.create_selector(
            BoardState::column_counts,
            SelectorOptions::default().label("column-counts"),
        );
        info!("🗂️ Seeded columns: {:?}", counts.select(&sidebar.state()));

        // Batched moves
        let scheduler = BatchScheduler::with_bus(config.batch_options(), &bus);
        let applied = Arc::new(AtomicUsize::new(0));
        for (i, card) in cards.iter().enumerate() {
            let target = session.columns[1 + i % (session.columns.len() - 1)].clone();
            let slice = editor.clone();
            let applied = applied.clone();
            let priority = if i == 0 { Priority::High } else { Priority::Normal };
            scheduler.batch_update(
                move |data: Value| {
                    let Some(card_id) = data.get("card").and_then(Value::as_str) else {
                        return;
                    };
                    match slice.batch_update(|board: &BoardState| board.move_card(card_id, &target), Some("batch")) {
                        Ok(()) => {
                            applied.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => warn!("⚠️ Card move failed: {}", e),
                    }
                },
                json!({ "card": card.id }),
                priority,
            );
        }
        scheduler.flush_batch();
        editor.update_state(json!({ "selected": cards[0].id }), Some("editor"))?;
        info!("🗂️ Columns after moves: {:?}", counts.select(&sidebar.state()));

        // Memoised totals
        let memo = Memoizer::new(config.memo_options()).with_bus(&bus);
        let done_column = session.columns[session.columns.len() - 1].clone();
        for _ in 0..2 {
            let board = editor.state();
            let points = memo.memoize(&(editor.revision(), &done_column), || board.points_in(&done_column))?;
            info!("🧮 Points in {}: {}", done_column, points);
        }

        // Synchronised copies
        let sync_options = || SyncOptions::new(format!("{}-copies", session.slice_id)).resolution(session.conflict_resolution);
        let planner = BoardCopy::attach(&bus, (*editor.state()).clone(), sync_options());
        let reviewer = BoardCopy::attach(&bus, (*editor.state()).clone(), sync_options());

        let conflicts = Arc::new(Mutex::new(Vec::new()));
        let conflict_log = conflicts.clone();
        let _conflict_sub = bus.subscribe(move |event: &Event<StateSyncConflict>| {
            conflict_log.lock().push(event.data.conflict_id.clone());
            Ok(())
        });

        reviewer.state.write().title = "Sprint (reviewed)".to_string();
        let mut planned = planner.snapshot();
        planned.selected = cards.last().map(|card| card.id.clone());
        *planner.state.write() = planned.clone();
        planner.sync.broadcast_state_change(&planned, "planner")?;

        // The reviewer merges the plan into its edit; the planner then takes
        // the merged board that the reviewer rebroadcasts.
        let mut raised = 0;
        loop {
            let pending: Vec<String> = conflicts.lock().drain(..).collect();
            if pending.is_empty() {
                break;
            }
            for conflict_id in pending {
                raised += 1;
                let owned_by_reviewer = reviewer
                    .sync
                    .pending_conflicts()
                    .iter()
                    .any(|conflict| conflict.conflict_id == conflict_id);
                if owned_by_reviewer {
                    let mut merged = planned.clone();
                    merged.title = reviewer.snapshot().title;
                    reviewer
                        .sync
                        .resolve_conflict(&conflict_id, ConflictChoice::Merge, Some(merged))?;
                } else {
                    planner
                        .sync
                        .resolve_conflict(&conflict_id, ConflictChoice::Remote, None)?;
                }
            }
        }

        // Paging
        let loader = LazyLoader::new(Arc::new(CardPages { cards: cards.clone() }), LazyOptions {
            page_size: 5,
            ..LazyOptions::default()
        })
        .with_bus(&bus);
        loader.go_to_page(0).await?;
        while let Some(page) = loader.load_more().await {
            page?;
        }
        ensure!(loader.loaded_items() == cards, "paged cards differ from the seeded cards");

        // Compression
        let compressor = StateCompressor::new(config.compression_config()).with_bus(&bus);
        let previous = serde_json::to_value(BoardState {
            cards: cards.clone(),
            ..BoardState::empty("Sprint")
        })?;
        let current = serde_json::to_value(&*editor.state())?;
        let packed = compressor.compress(&current, Some(&previous))?;
        let restored = compressor.decompress(&packed, Some(&previous))?;
        ensure!(restored == current, "compressed board did not round-trip");

        let stats = bus.stats();
        let mut report = SessionReport {
            cards: cards.len(),
            slices_converged: *editor.state() == *sidebar.state(),
            copies_converged: planner.snapshot() == reviewer.snapshot(),
            batch_updates_applied: applied.load(Ordering::SeqCst),
            memo_hits: memo.stats().hits,
            conflicts_raised: raised,
            pages_loaded: loader.current_page() + 1,
            compression_ratio: packed.ratio(),
            events_emitted: stats.events_emitted,
            handler_failures: stats.handler_failures,
            debug_entries: 0,
            export_path: None,
        };

        if let Some(recorder) = &recorder {
            report.debug_entries = recorder.len();
            let state_updates = recorder.entries(&DebugFilter::of_type(DebugEntryType::StateUpdate));
            info!("🔍 Recorded {} entries ({} state updates)", recorder.len(), state_updates.len());
            if self.export {
                let path = recorder
                    .export_to_file(&config.debug.export_dir)
                    .context("exporting debug trace")?;
                report.export_path = Some(path);
            }
        }

        log_final_report(&report);
        Ok(report)
    }

    fn log_configuration_summary(&self) {
        info!("📋 Configuration Summary:");
        info!("  🧩 Slice: {} ({} cards)", self.config.session.slice_id, self.config.session.card_count);
        info!("  🗂️ Columns: {}", self.config.session.columns.join(" → "));
        info!("  🤝 Conflict resolution: {:?}", self.config.session.conflict_resolution);
        info!(
            "  📦 Batching: {} per cycle every {}ms",
            self.config.batching.max_batch_size, self.config.batching.flush_interval_ms
        );
        info!(
            "  🗜️ Compression: {} above {} bytes",
            self.config.compression.algorithm, self.config.compression.threshold
        );
    }
}

fn seed_cards(count: usize, column: &str) -> Vec<Card> {
    (0..count)
        .map(|i| Card {
            id: format!("card-{i}"),
            title: format!("Task {}", i + 1),
            column: column.to_string(),
            points: (i % 5 + 1) as u32,
        })
        .collect()
}

fn log_final_report(report: &SessionReport) {
    info!("📊 Session Report:");
    info!("  - Cards: {} | batch moves applied: {}", report.cards, report.batch_updates_applied);
    info!(
        "  - Slices converged: {} | copies converged: {}",
        report.slices_converged, report.copies_converged
    );
    info!("  - Conflicts raised: {} | memo hits: {}", report.conflicts_raised, report.memo_hits);
    info!(
        "  - Pages loaded: {} | compression ratio: {:.2}",
        report.pages_loaded, report.compression_ratio
    );
    info!(
        "  - Events emitted: {} | handler failures: {}",
        report.events_emitted, report.handler_failures
    );
    if let Some(path) = &report.export_path {
        info!("  - Debug trace: {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statehub_core::{CompressionAlgorithm, ConflictResolution};

    fn config_in(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.debug.export_dir = dir.to_path_buf();
        config
    }

    #[tokio::test]
    async fn session_converges_and_exports() {
        let dir = tempfile::tempdir().unwrap();
        let report = Application::from_config(config_in(dir.path()))
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(report.cards, 12);
        assert!(report.slices_converged);
        assert!(report.copies_converged);
        assert_eq!(report.batch_updates_applied, 12);
        assert_eq!(report.memo_hits, 1);
        assert_eq!(report.conflicts_raised, 2);
        assert_eq!(report.handler_failures, 0);
        assert!(report.debug_entries > 0);

        let path = report.export_path.unwrap();
        assert!(path.starts_with(dir.path()));
        let export: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert!(export["entries"].as_array().is_some_and(|entries| !entries.is_empty()));
    }

    #[tokio::test]
    async fn latest_wins_session_has_no_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.session.conflict_resolution = ConflictResolution::LatestWins;
        config.session.card_count = 10;
        config.compression.algorithm = CompressionAlgorithm::Diff;
        config.compression.threshold = 0;
        config.debug.export_on_exit = false;

        let report = Application::from_config(config).unwrap().run().await.unwrap();
        assert_eq!(report.conflicts_raised, 0);
        assert!(report.copies_converged);
        assert!(report.compression_ratio > 0.0);
        assert!(report.export_path.is_none());
        // 10 cards in pages of 5 end with an empty page
        assert_eq!(report.pages_loaded, 3);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let mut config = AppConfig::default();
        config.session.card_count = 0;
        assert!(Application::from_config(config).is_err());
    }
}
