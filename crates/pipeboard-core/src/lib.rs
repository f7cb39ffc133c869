//! Core domain model and pipeline aggregates for Pipeboard.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "pipeboard-core";

/// Kanban bucket derived from a deal's status label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ToDo,
    #[default]
    InProgress,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ToDo => "to_do",
            Stage::InProgress => "in_progress",
            Stage::Complete => "complete",
        }
    }
}

const TODO_STATUSES: [&str; 4] = [
    "Novo Lead",
    "Tentativa de contato",
    "Lead Interessado",
    "Contato Realizado",
];

const COMPLETE_STATUSES: [&str; 4] = [
    "Contrato enviado",
    "Iniciar Implementação",
    "PERDA",
    "ARQUIVO",
];

pub const WON_STATUSES: [&str; 2] = ["Iniciar Implementação", "Contrato enviado"];
pub const LOST_STATUS: &str = "PERDA";

/// Exact-match classification over the closed status lists. Unknown and
/// empty labels count as in progress.
pub fn stage_for_status(status: &str) -> Stage {
    if TODO_STATUSES.contains(&status) {
        Stage::ToDo
    } else if COMPLETE_STATUSES.contains(&status) {
        Stage::Complete
    } else {
        Stage::InProgress
    }
}

/// Flat dashboard record mirrored from one remote page. Every field has a
/// total default so a missing upstream property never produces an undefined
/// value on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    pub id: String,
    pub title: String,
    pub value: f64,
    pub status: String,
    pub created_at: String,
    pub last_update: String,
    pub gk: String,
    pub quality: String,
    pub loss_reason: String,
    pub phone: String,
    pub whatsapp: String,
    pub email: String,
    pub instagram: String,
    pub site: String,
    pub decisor: String,
    pub cidade: String,
    pub cnpj: String,
    pub negotiating: String,
    pub stage: Stage,
}

impl Deal {
    pub fn is_won(&self) -> bool {
        WON_STATUSES.contains(&self.status.as_str())
    }

    pub fn is_lost(&self) -> bool {
        self.status == LOST_STATUS
    }
}

/// Accepts both timestamp forms the remote emits: full RFC 3339 and bare
/// `YYYY-MM-DD` dates, which resolve to midnight UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Dashboard aggregates over one snapshot of deals.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineMetrics {
    pub total: usize,
    pub won: usize,
    pub lost: usize,
    pub active: usize,
    pub total_value: f64,
    pub won_value: f64,
    pub conversion_rate: f64,
    pub avg_closing_days: i64,
    pub stuck: usize,
    pub funnel: FunnelCounts,
    pub value_by_stage: StageValues,
}

/// Per-bucket deal counts feeding the funnel chart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelCounts {
    pub to_do: usize,
    pub in_progress: usize,
    pub won: usize,
    pub lost: usize,
}

/// Summed proposal values per bucket; lost deals carry no bucket here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageValues {
    pub to_do: f64,
    pub in_progress: f64,
    pub won: f64,
}

const STUCK_AFTER_DAYS: i64 = 30;

impl PipelineMetrics {
    /// Aggregates a snapshot. `now` is the cutoff reference for stuck-deal
    /// detection. Deals with unparseable timestamps are never counted as
    /// stuck and contribute no closing-time span.
    pub fn compute(deals: &[Deal], now: DateTime<Utc>) -> Self {
        let won_deals: Vec<&Deal> = deals.iter().filter(|d| d.is_won()).collect();
        let won = won_deals.len();
        let lost = deals.iter().filter(|d| d.is_lost()).count();
        let active = deals.iter().filter(|d| d.stage == Stage::InProgress).count();

        let total_value: f64 = deals.iter().map(|d| d.value).sum();
        let won_value: f64 = won_deals.iter().map(|d| d.value).sum();

        let closed = won + lost;
        let conversion_rate = if closed > 0 {
            ((won as f64 / closed as f64) * 1000.0).round() / 10.0
        } else {
            0.0
        };

        let closing_spans: Vec<i64> = won_deals
            .iter()
            .filter_map(|d| {
                let created = parse_timestamp(&d.created_at)?;
                let updated = parse_timestamp(&d.last_update)?;
                Some((updated - created).num_days())
            })
            .collect();
        let avg_closing_days = if closing_spans.is_empty() {
            0
        } else {
            closing_spans.iter().sum::<i64>() / closing_spans.len() as i64
        };

        let stuck = deals
            .iter()
            .filter(|d| d.stage == Stage::InProgress)
            .filter(|d| {
                parse_timestamp(&d.last_update)
                    .map(|updated| (now - updated).num_days() > STUCK_AFTER_DAYS)
                    .unwrap_or(false)
            })
            .count();

        let funnel = FunnelCounts {
            to_do: deals.iter().filter(|d| d.stage == Stage::ToDo).count(),
            in_progress: active,
            won,
            lost,
        };
        let value_by_stage = StageValues {
            to_do: deals
                .iter()
                .filter(|d| d.stage == Stage::ToDo)
                .map(|d| d.value)
                .sum(),
            in_progress: deals
                .iter()
                .filter(|d| d.stage == Stage::InProgress)
                .map(|d| d.value)
                .sum(),
            won: won_value,
        };

        Self {
            total: deals.len(),
            won,
            lost,
            active,
            total_value,
            won_value,
            conversion_rate,
            avg_closing_days,
            stuck,
            funnel,
            value_by_stage,
        }
    }
}

/// Kanban columns, input order preserved within each column.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct StageBoard {
    pub to_do: Vec<Deal>,
    pub in_progress: Vec<Deal>,
    pub complete: Vec<Deal>,
}

impl StageBoard {
    pub fn group(deals: Vec<Deal>) -> Self {
        let mut board = Self::default();
        for deal in deals {
            match deal.stage {
                Stage::ToDo => board.to_do.push(deal),
                Stage::InProgress => board.in_progress.push(deal),
                Stage::Complete => board.complete.push(deal),
            }
        }
        board
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn mk_deal(title: &str, status: &str, value: f64) -> Deal {
        Deal {
            id: format!("page-{title}"),
            title: title.to_string(),
            value,
            status: status.to_string(),
            stage: stage_for_status(status),
            ..Deal::default()
        }
    }

    fn mk_dated_deal(title: &str, status: &str, created_at: &str, last_update: &str) -> Deal {
        Deal {
            created_at: created_at.to_string(),
            last_update: last_update.to_string(),
            ..mk_deal(title, status, 0.0)
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 26, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn classification_covers_both_status_lists() {
        for status in TODO_STATUSES {
            assert_eq!(stage_for_status(status), Stage::ToDo, "{status}");
        }
        for status in COMPLETE_STATUSES {
            assert_eq!(stage_for_status(status), Stage::Complete, "{status}");
        }
        assert_eq!(stage_for_status("Follow Up"), Stage::InProgress);
        assert_eq!(stage_for_status(""), Stage::InProgress);
        assert_eq!(stage_for_status("novo lead"), Stage::InProgress);
    }

    #[test]
    fn default_deal_is_fully_blank() {
        let deal = Deal::default();
        assert_eq!(deal.title, "");
        assert_eq!(deal.value, 0.0);
        assert_eq!(deal.status, "");
        assert_eq!(deal.stage, Stage::InProgress);
    }

    #[test]
    fn deal_serializes_with_camel_case_wire_names() {
        let deal = mk_dated_deal("Padaria Central", "Novo Lead", "2026-01-01", "2026-01-02");
        let value = serde_json::to_value(&deal).unwrap();
        assert_eq!(value["createdAt"], "2026-01-01");
        assert_eq!(value["lastUpdate"], "2026-01-02");
        assert_eq!(value["lossReason"], "");
        assert_eq!(value["stage"], "to_do");
    }

    #[test]
    fn empty_snapshot_has_zero_conversion_rate() {
        let metrics = PipelineMetrics::compute(&[], fixed_now());
        assert_eq!(metrics.total, 0);
        assert_eq!(metrics.conversion_rate, 0.0);
        assert_eq!(metrics.avg_closing_days, 0);
        assert_eq!(metrics.stuck, 0);
    }

    #[test]
    fn lost_deals_count_but_never_add_won_value() {
        let deals = vec![
            mk_deal("Mercearia", "PERDA", 100.0),
            mk_deal("Padaria", "PERDA", 200.0),
        ];
        let metrics = PipelineMetrics::compute(&deals, fixed_now());
        assert_eq!(metrics.lost, 2);
        assert_eq!(metrics.won, 0);
        assert_eq!(metrics.won_value, 0.0);
        assert_eq!(metrics.total_value, 300.0);
        assert_eq!(metrics.conversion_rate, 0.0);
    }

    #[test]
    fn conversion_rate_rounds_to_one_decimal() {
        let deals = vec![
            mk_deal("Ganha", "Contrato enviado", 500.0),
            mk_deal("Perdida A", "PERDA", 0.0),
            mk_deal("Perdida B", "PERDA", 0.0),
        ];
        let metrics = PipelineMetrics::compute(&deals, fixed_now());
        assert_eq!(metrics.conversion_rate, 33.3);
        assert_eq!(metrics.won_value, 500.0);
    }

    #[test]
    fn closing_time_averages_whole_days_over_won_deals() {
        let deals = vec![
            mk_dated_deal(
                "Rapida",
                "Contrato enviado",
                "2026-01-01T00:00:00.000Z",
                "2026-01-06T00:00:00.000Z",
            ),
            mk_dated_deal(
                "Lenta",
                "Iniciar Implementação",
                "2026-01-01T00:00:00.000Z",
                "2026-01-11T12:00:00.000Z",
            ),
            mk_dated_deal("Perdida", "PERDA", "2026-01-01", "2026-03-01"),
        ];
        // spans are 5 and 10 (half days truncate); the lost deal is ignored
        let metrics = PipelineMetrics::compute(&deals, fixed_now());
        assert_eq!(metrics.avg_closing_days, 7);
    }

    #[test]
    fn undated_wins_are_excluded_from_the_closing_average() {
        let deals = vec![
            mk_dated_deal("Datada", "Contrato enviado", "2026-01-01", "2026-01-11"),
            mk_dated_deal("Sem datas", "Contrato enviado", "", "not-a-date"),
        ];
        let metrics = PipelineMetrics::compute(&deals, fixed_now());
        assert_eq!(metrics.won, 2);
        // out of the mean entirely, not averaged in as a zero-day span
        assert_eq!(metrics.avg_closing_days, 10);
    }

    #[test]
    fn stuck_counts_only_stale_in_progress_deals() {
        let deals = vec![
            mk_dated_deal("Parada", "Follow Up", "2026-06-01", "2026-07-25T00:00:00.000Z"),
            mk_dated_deal("No limite", "Follow Up", "2026-06-01", "2026-07-27T00:00:00.000Z"),
            mk_dated_deal("Fechada antiga", "ARQUIVO", "2026-01-01", "2026-02-01"),
            mk_dated_deal("Sem data", "Follow Up", "", "not-a-date"),
        ];
        // 32 days old counts, 30 days does not, complete and unparseable never do
        let metrics = PipelineMetrics::compute(&deals, fixed_now());
        assert_eq!(metrics.stuck, 1);
    }

    #[test]
    fn funnel_and_stage_values_split_by_bucket() {
        let deals = vec![
            mk_deal("Novo", "Novo Lead", 50.0),
            mk_deal("Negociando", "Follow Up", 75.0),
            mk_deal("Ganha", "Contrato enviado", 300.0),
            mk_deal("Perdida", "PERDA", 40.0),
        ];
        let metrics = PipelineMetrics::compute(&deals, fixed_now());
        assert_eq!(metrics.funnel.to_do, 1);
        assert_eq!(metrics.funnel.in_progress, 1);
        assert_eq!(metrics.funnel.won, 1);
        assert_eq!(metrics.funnel.lost, 1);
        assert_eq!(metrics.value_by_stage.to_do, 50.0);
        assert_eq!(metrics.value_by_stage.in_progress, 75.0);
        assert_eq!(metrics.value_by_stage.won, 300.0);
        assert_eq!(metrics.active, 1);
    }

    #[test]
    fn board_groups_preserve_input_order() {
        let deals = vec![
            mk_deal("A", "Novo Lead", 1.0),
            mk_deal("B", "Follow Up", 2.0),
            mk_deal("C", "Lead Interessado", 3.0),
            mk_deal("D", "ARQUIVO", 4.0),
        ];
        let board = StageBoard::group(deals);
        let todo_titles: Vec<&str> = board.to_do.iter().map(|d| d.title.as_str()).collect();
        assert_eq!(todo_titles, vec!["A", "C"]);
        assert_eq!(board.in_progress.len(), 1);
        assert_eq!(board.complete.len(), 1);
    }

    #[test]
    fn timestamps_parse_in_both_remote_forms() {
        assert!(parse_timestamp("2026-03-01T10:00:00.000Z").is_some());
        let midnight = parse_timestamp("2026-03-01").unwrap();
        assert_eq!(
            midnight,
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap()
        );
        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("").is_none());
    }
}
