//! Merge selection and execution.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use strata_agg::AggregatingSortedInputStream;
use strata_column::Block;
use strata_error::Result;
use strata_stream::{
    BlockInputStream, CollapsingSortedInputStream, ExecControl, MergingSortedInputStream,
    SummingSortedInputStream,
};
use strata_types::{SortColumnDescription, SortDescription};
use tracing::{debug, info};

use crate::data::MergeTreeData;
use crate::part::{DataPartPtr, PartInfo};
use crate::reader::MergeTreeBlockInputStream;
use crate::writer::PartWriter;

/// How rows with equal keys combine when parts coalesce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeMode {
    /// Keep every row.
    Ordinary,
    /// Pair-cancel rows whose sign column nets to zero.
    Collapsing { sign_column: String },
    /// Sum numeric non-key columns.
    Summing,
    /// Merge aggregate-state columns.
    Aggregating,
}

/// Approves or refuses merging a pair of neighbouring parts.
///
/// The replicated layer injects a predicate that checks no insert can
/// still land between the two and reserves the merge; the local default
/// only refuses parts already being merged.
pub type CanMergePredicate = Arc<dyn Fn(&DataPartPtr, &DataPartPtr) -> bool + Send + Sync>;

#[must_use]
pub fn local_can_merge() -> CanMergePredicate {
    Arc::new(|a: &DataPartPtr, b: &DataPartPtr| !a.is_merging() && !b.is_merging())
}

/// Extra disk-usage margin over the summed input sizes.
const DISK_USAGE_MARGIN: f64 = 1.1;
/// UTC hours during which the size-ratio guard is relaxed.
const NIGHT_HOURS: std::ops::Range<u64> = 1..5;

/// Pick a contiguous run of active parts to merge, and reserve them.
///
/// Returns parts already flagged `currently_merging`; the caller must
/// either merge them or release the reservations.
pub fn select_parts_to_merge(
    data: &MergeTreeData,
    can_merge: &CanMergePredicate,
    available_disk_bytes: Option<u64>,
    big_merge_slots_in_use: usize,
    max_big_merge_slots: usize,
    aggressive: bool,
) -> Option<Vec<DataPartPtr>> {
    let settings = &data.settings;
    let parts = data.active_parts();
    if parts.len() < 2 {
        return None;
    }

    let hour_utc = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_secs() % 86_400) / 3_600)
        .unwrap_or(12);
    let mut ratio = settings.size_ratio_coefficient_to_merge_parts;
    if NIGHT_HOURS.contains(&hour_utc) {
        ratio += settings.merge_parts_at_night_inc;
    }
    let current_month = current_month_utc();

    let mut best: Option<Vec<DataPartPtr>> = None;
    let mut best_score = (0_usize, 0_u64);

    for start in 0..parts.len() {
        let first = &parts[start];
        if first.size_in_bytes > settings.max_bytes_to_merge_parts && !aggressive {
            continue;
        }
        if !can_merge_alone(first) {
            continue;
        }

        let mut run = vec![Arc::clone(first)];
        let mut total_bytes = first.size_in_bytes;
        let mut max_bytes = first.size_in_bytes;

        for candidate in parts.iter().skip(start + 1) {
            if run.len() >= settings.max_parts_to_merge_at_once {
                break;
            }
            if candidate.info.partition != first.info.partition {
                break;
            }
            if candidate.size_in_bytes > settings.max_bytes_to_merge_parts && !aggressive {
                break;
            }
            let last = run
                .last()
                .map(Arc::clone)
                .unwrap_or_else(|| Arc::clone(first));
            if !can_merge(&last, candidate) {
                break;
            }
            run.push(Arc::clone(candidate));
            total_bytes += candidate.size_in_bytes;
            max_bytes = max_bytes.max(candidate.size_in_bytes);
        }

        if run.len() < 2 {
            continue;
        }

        // Size-ratio guard: do not re-copy a huge part to glue crumbs
        // onto it. Relaxed at night, and entirely off for partitions
        // older than the previous month when configured so.
        let old_month = first.info.partition < previous_month(current_month);
        let ratio_exempt =
            aggressive || (old_month && settings.merge_anything_for_old_months);
        if !ratio_exempt {
            let sum_others = total_bytes - max_bytes;
            if sum_others == 0 {
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            if max_bytes as f64 / sum_others as f64 > ratio {
                continue;
            }
        }

        // Big merges are throttled so small housekeeping always has
        // workers left.
        let is_big = run
            .iter()
            .any(|p| p.size_in_bytes >= settings.max_bytes_to_merge_parts_small);
        if is_big && big_merge_slots_in_use >= max_big_merge_slots {
            continue;
        }

        if let Some(available) = available_disk_bytes {
            #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
            let needed = (total_bytes as f64 * DISK_USAGE_MARGIN) as u64;
            if needed > available {
                continue;
            }
        }

        let score = (run.len(), total_bytes);
        if score > best_score {
            best_score = score;
            best = Some(run);
        }
    }

    let chosen = best?;
    // Reserve; losing any reservation aborts this selection.
    for (i, part) in chosen.iter().enumerate() {
        if !part.try_reserve_for_merge() {
            for earlier in &chosen[..i] {
                earlier.release_merge_reservation();
            }
            return None;
        }
    }
    debug!(
        parts = chosen.len(),
        first = %chosen[0].name,
        last = %chosen[chosen.len() - 1].name,
        "selected parts to merge"
    );
    Some(chosen)
}

fn can_merge_alone(part: &DataPartPtr) -> bool {
    !part.is_merging()
}

fn current_month_utc() -> u32 {
    let days = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_secs() / 86_400) as u16)
        .unwrap_or(0);
    strata_types::dates::month_of_date(days)
}

const fn previous_month(month: u32) -> u32 {
    if month % 100 == 1 {
        month - 100 + 11
    } else {
        month - 1
    }
}

/// Merge the reserved run into one level-up part and swap it into the
/// active set. Reservations are released on every path.
pub fn merge_parts(
    data: &Arc<MergeTreeData>,
    parts: Vec<DataPartPtr>,
) -> Result<DataPartPtr> {
    let result = merge_parts_inner(data, &parts);
    for part in &parts {
        part.release_merge_reservation();
    }
    result
}

fn merge_parts_inner(data: &Arc<MergeTreeData>, parts: &[DataPartPtr]) -> Result<DataPartPtr> {
    let first = parts
        .first()
        .ok_or_else(|| strata_error::StrataError::EmptyData {
            operation: "merge of parts",
        })?;
    let last = parts
        .last()
        .ok_or_else(|| strata_error::StrataError::EmptyData {
            operation: "merge of parts",
        })?;
    let info = PartInfo {
        partition: first.info.partition,
        min_id: first.info.min_id,
        max_id: last.info.max_id,
        level: 1 + parts.iter().map(|p| p.info.level).max().unwrap_or(0),
    };
    info!(
        output = %info.name(),
        inputs = parts.len(),
        "merging parts"
    );

    let control = ExecControl::unlimited();
    let column_names: Vec<String> = data.schema().iter().map(|c| c.name.clone()).collect();
    let sort_description: SortDescription = data
        .primary_keys
        .iter()
        .map(|k| SortColumnDescription::ascending(k.clone()))
        .collect();

    let sources: Result<Vec<Box<dyn BlockInputStream>>> = parts
        .iter()
        .map(|part| {
            MergeTreeBlockInputStream::whole_part(
                Arc::clone(part),
                column_names.clone(),
                data.schema(),
                data.settings.index_granularity,
                data.settings.index_granularity,
                Arc::clone(&control),
            )
            .map(|s| Box::new(s) as Box<dyn BlockInputStream>)
        })
        .collect();

    let merged = MergingSortedInputStream::new(
        sources?,
        sort_description.clone(),
        data.settings.index_granularity,
        Arc::clone(&control),
    );

    let mut stream: Box<dyn BlockInputStream> = match &data.mode {
        MergeMode::Ordinary => Box::new(merged),
        MergeMode::Collapsing { sign_column } => Box::new(CollapsingSortedInputStream::new(
            Box::new(merged),
            sort_description,
            sign_column.clone(),
            data.settings.index_granularity,
            Arc::clone(&control),
        )),
        MergeMode::Summing => Box::new(SummingSortedInputStream::new(
            Box::new(merged),
            sort_description,
            data.settings.index_granularity,
            Arc::clone(&control),
        )),
        MergeMode::Aggregating => Box::new(AggregatingSortedInputStream::new(
            Box::new(merged),
            sort_description,
            data.settings.index_granularity,
            Arc::clone(&control),
        )),
    };

    let mut writer = PartWriter::new(Arc::clone(data), info)?;
    loop {
        let block: Block = stream.read()?;
        if block.is_empty() {
            break;
        }
        writer.write(&block)?;
    }
    let new_part = Arc::new(writer.finish()?);

    // The swap is transactional: a publisher failing right after this
    // call rolls the set back by dropping the transaction.
    let transaction = data.replace_parts(parts.to_vec(), vec![Arc::clone(&new_part)]);
    transaction.commit();

    info!(part = %new_part.name, rows = new_part.rows, "merge committed");
    Ok(new_part)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_previous_month_wraps_year() {
        assert_eq!(previous_month(201_612), 201_611);
        assert_eq!(previous_month(201_701), 201_612);
    }
}
