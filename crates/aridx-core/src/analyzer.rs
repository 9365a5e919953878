//! The analyzer driver.
//!
//! For each input path a report directory is created next to it, the input
//! tree is walked, and results propagate bottom-up: regular files are
//! hashed and matched through the throttler, non-regular files resolve
//! immediately as deferred, and each directory's reduction runs through a
//! completion listener once every child has a result.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info};

use aridx_store::{
    report_directory_for, ArchiveStore, DuplicateMatch, DuplicateMatchRule, DuplicateRecord,
    MetadataMatches, ReportManifest, ReportStore,
};
use aridx_sync::{DirectoryListener, ListenerCoordinator, TaskGroup, Throttler};
use aridx_walk::FileContext;

use crate::error::{CoreError, Result};
use crate::hashalg::HashAlgorithm;
use crate::matcher::find_matching_class;
use crate::processor::Processor;
use crate::reducer::{record_path, reduce_directory};
use crate::result::{AggregateCounters, AnalysisResult};
use crate::walk::walk_input;

type ResultListener = DirectoryListener<AnalysisResult>;

struct AnalysisShared {
    store: Arc<ArchiveStore>,
    processor: Arc<Processor>,
    algorithm: &'static HashAlgorithm,
    rule: DuplicateMatchRule,
    archive_path: PathBuf,
    input_root: PathBuf,
    report: ReportStore,
}

pub(crate) async fn do_analyze(
    store: &Arc<ArchiveStore>,
    processor: &Arc<Processor>,
    algorithm: &'static HashAlgorithm,
    input_paths: &[PathBuf],
    rule: DuplicateMatchRule,
) -> Result<()> {
    let archive_id = store
        .get_archive_id()?
        .ok_or(CoreError::ArchiveIdMissing)?;

    for input in input_paths {
        analyze_one(store, processor, algorithm, input, rule, &archive_id).await?;
    }
    Ok(())
}

async fn analyze_one(
    store: &Arc<ArchiveStore>,
    processor: &Arc<Processor>,
    algorithm: &'static HashAlgorithm,
    input: &Path,
    rule: DuplicateMatchRule,
    archive_id: &str,
) -> Result<()> {
    let input_root = std::path::absolute(input)?;
    let report_dir = report_directory_for(&input_root);
    info!(input = %input_root.display(), report = %report_dir.display(), "analyzing");

    let report = ReportStore::open(&report_dir, true)?;
    report.write_manifest(&ReportManifest::new(
        &std::path::absolute(store.archive_path())?,
        archive_id.to_string(),
        chrono::Utc::now().to_rfc3339(),
        rule,
    ))?;

    let group: Arc<TaskGroup<CoreError>> = Arc::new(TaskGroup::new());
    let coordinator = ListenerCoordinator::new(Arc::clone(&group));
    let throttler = Throttler::new(Arc::clone(&group), processor.concurrency() * 2);

    let shared = Arc::new(AnalysisShared {
        store: Arc::clone(store),
        processor: Arc::clone(processor),
        algorithm,
        rule,
        archive_path: store.archive_path().to_path_buf(),
        input_root: input_root.clone(),
        report,
    });

    // Directories currently on the walk path, innermost last. Pre-order
    // guarantees that once an entry's parent is not the top of this stack,
    // everything above the parent is fully enumerated.
    let mut open_dirs: Vec<(Arc<FileContext>, ResultListener)> = Vec::new();

    for (path, context) in walk_input(&input_root) {
        while let Some((top, listener)) = open_dirs.last() {
            let parent_is_top = context
                .parent()
                .map(|parent| Arc::ptr_eq(parent, top))
                .unwrap_or(false);
            if parent_is_top {
                break;
            }
            listener.complete();
            open_dirs.pop();
        }

        if context.is_dir() {
            let listener = coordinator.register_directory::<AnalysisResult>();
            context.attach(listener.clone());

            let callback_shared = Arc::clone(&shared);
            let dir_path = path.clone();
            let dir_name = context.name().to_string();
            let result_rx = coordinator.schedule_callback(&listener, move |outcomes| async move {
                let result = reduce_directory(
                    &callback_shared.archive_path,
                    &callback_shared.input_root,
                    callback_shared.rule,
                    &dir_path,
                    dir_name,
                    outcomes,
                )?;
                if let AnalysisResult::Immediate {
                    record: Some(record),
                    ..
                } = &result
                {
                    callback_shared.report.write_record(record)?;
                }
                Ok(result)
            })?;

            register_with_parent(&context, result_rx)?;
            open_dirs.push((context, listener));
        } else if context.is_file() {
            let (tx, rx) = oneshot::channel();
            register_with_parent(&context, rx)?;

            let task_shared = Arc::clone(&shared);
            let file_path = path.clone();
            let file_name = context.name().to_string();
            let size = context.metadata().len();
            throttler
                .schedule(async move {
                    let result = analyze_file(&task_shared, &file_path, file_name, size).await?;
                    let _ = tx.send(result);
                    Ok(())
                })
                .await?;
        } else {
            // Non-regular files defer to the parent directory's comparison.
            let (tx, rx) = oneshot::channel();
            register_with_parent(&context, rx)?;
            let _ = tx.send(AnalysisResult::Deferred {
                base_name: context.name().to_string(),
                counters: AggregateCounters {
                    total_size: 0,
                    total_items: 1,
                    duplicated_size: 0,
                    duplicated_items: 0,
                },
            });
        }
    }

    while let Some((_, listener)) = open_dirs.pop() {
        listener.complete();
    }

    group.join_all().await?;
    Ok(())
}

fn register_with_parent(
    context: &FileContext,
    receiver: oneshot::Receiver<AnalysisResult>,
) -> Result<()> {
    let Some(parent) = context.parent() else {
        // The walk root has no parent; its result has no consumer.
        return Ok(());
    };
    if let Some(listener) = parent.attachment::<ResultListener>() {
        listener.add_child(receiver)?;
    }
    Ok(())
}

/// Hash-and-match one regular file, writing a record when duplicates exist.
async fn analyze_file(
    shared: &AnalysisShared,
    file_path: &Path,
    base_name: String,
    size: u64,
) -> Result<AnalysisResult> {
    let mut counters = AggregateCounters {
        total_size: size,
        total_items: 1,
        duplicated_size: 0,
        duplicated_items: 0,
    };

    let class = match find_matching_class(
        &shared.store,
        &shared.processor,
        shared.algorithm,
        file_path,
    )
    .await
    {
        Ok(class) => class,
        // Vanished mid-analysis: no duplicates, keep going.
        Err(CoreError::Io(error)) if error.kind() == std::io::ErrorKind::NotFound => None,
        Err(error) => return Err(error),
    };

    let Some(class_paths) = class else {
        return Ok(AnalysisResult::Immediate {
            base_name,
            record: None,
            counters,
        });
    };

    let analyzed_stat = match std::fs::metadata(file_path) {
        Ok(stat) => stat,
        Err(_) => {
            return Ok(AnalysisResult::Immediate {
                base_name,
                record: None,
                counters,
            })
        }
    };

    let mut matches = Vec::with_capacity(class_paths.len());
    for member in &class_paths {
        let member_stat = match std::fs::metadata(shared.archive_path.join(member)) {
            Ok(stat) => stat,
            // An archive member that vanished offers no comparison.
            Err(_) => continue,
        };
        let flags = MetadataMatches::from_stats(&analyzed_stat, &member_stat);
        let is_identical = shared.rule.calculate_is_identical(&flags);
        matches.push(DuplicateMatch {
            path: member.clone(),
            matches: flags,
            duplicated_size: size,
            duplicated_items: 1,
            is_identical,
            // Files are atomic: superset equals identical.
            is_superset: is_identical,
            rule: shared.rule,
        });
    }

    if matches.is_empty() {
        return Ok(AnalysisResult::Immediate {
            base_name,
            record: None,
            counters,
        });
    }

    counters.duplicated_size = size;
    counters.duplicated_items = 1;

    let record = DuplicateRecord {
        path: record_path(&shared.input_root, file_path),
        matches,
        total_size: size,
        total_items: 1,
        duplicated_size: size,
        duplicated_items: 1,
    };
    shared.report.write_record(&record)?;
    debug!(path = %record.path.display(), matches = record.matches.len(), "duplicate record written");

    Ok(AnalysisResult::Immediate {
        base_name,
        record: Some(record),
        counters,
    })
}
