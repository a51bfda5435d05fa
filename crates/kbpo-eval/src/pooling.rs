//! Official-style slot filling scores and pooling bias
//!
//! Assessed gold entries and system outputs are keyed by query entity and
//! slot value, optionally with the first relation provenance. Each query
//! entity yields counts `S` (distinct submitted keys), `C` (correct
//! equivalence classes found) and `T` (correct equivalence classes in the
//! gold), which give micro and macro averaged scores.
//!
//! Pooling bias compares the score on the full gold pool with the score on
//! pools restricted to entries some *other* run (leave-one-out) or some run
//! of another team (leave-team-out) also produced.

use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;

use kbpo_core::{f1_score, KbpoError, Result, Score};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bootstrap::{Bootstrap, Interval};
use crate::sampler::Sampler;

// ============================================================================
// Modes
// ============================================================================

/// How gold and output entries are matched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolingMode {
    /// Key includes the provenance
    #[default]
    ClosedWorld,
    /// Closed world, with output outside the gold set dropped
    Condensed,
    /// Key ignores the provenance
    Anydoc,
    /// Anydoc, with output outside the gold set dropped
    CondensedAnydoc,
}

impl PoolingMode {
    pub const ALL: [PoolingMode; 4] = [
        PoolingMode::ClosedWorld,
        PoolingMode::Condensed,
        PoolingMode::Anydoc,
        PoolingMode::CondensedAnydoc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClosedWorld => "closed-world",
            Self::Condensed => "condensed",
            Self::Anydoc => "anydoc",
            Self::CondensedAnydoc => "condensed-anydoc",
        }
    }

    pub fn uses_provenance(&self) -> bool {
        matches!(self, Self::ClosedWorld | Self::Condensed)
    }

    pub fn is_condensed(&self) -> bool {
        matches!(self, Self::Condensed | Self::CondensedAnydoc)
    }
}

impl std::fmt::Display for PoolingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PoolingMode {
    type Err = KbpoError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| KbpoError::Validation(format!("unsupported pooling mode: {s}")))
    }
}

// ============================================================================
// Entries
// ============================================================================

/// One assessed gold entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldEntry {
    pub id: String,
    pub query_id: String,
    pub relation: String,
    pub relation_provenances: Vec<String>,
    pub slot_value: String,
    pub slot_provenances: Vec<String>,
    pub slot_value_label: String,
    pub relation_label: String,
    pub eq_class: String,
    /// Equivalence class number; 0 for wrong entries
    pub eq: u32,
}

/// One system output entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEntry {
    pub query_id: String,
    pub relation: String,
    pub run_id: String,
    pub relation_provenances: Vec<String>,
    pub slot_value: String,
    pub slot_type: String,
    pub slot_provenances: Vec<String>,
    pub confidence: f64,
}

fn fields(line: &str, expected: usize) -> Result<Vec<&str>> {
    let parts: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
    if parts.len() < expected {
        return Err(KbpoError::Validation(format!(
            "expected {expected} columns, found {}",
            parts.len()
        )));
    }
    Ok(parts)
}

fn spans(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl GoldEntry {
    pub fn from_line(line: &str) -> Result<Self> {
        let parts = fields(line, 8)?;
        let (query_id, relation) = parts[1].split_once(':').ok_or_else(|| {
            KbpoError::Validation(format!("malformed query slot '{}'", parts[1]))
        })?;
        let eq_class = parts[7].trim().to_string();
        let eq = eq_class
            .rsplit(':')
            .next()
            .unwrap_or("")
            .parse::<u32>()
            .map_err(|e| KbpoError::Validation(format!("malformed equivalence class '{eq_class}': {e}")))?;
        Ok(Self {
            id: parts[0].to_string(),
            query_id: query_id.to_string(),
            relation: relation.to_string(),
            relation_provenances: spans(parts[2]),
            slot_value: parts[3].to_string(),
            slot_provenances: spans(parts[4]),
            slot_value_label: parts[5].to_string(),
            relation_label: parts[6].to_string(),
            eq_class,
            eq,
        })
    }
}

impl OutputEntry {
    pub fn from_line(line: &str) -> Result<Self> {
        let parts = fields(line, 8)?;
        let confidence = parts[7]
            .trim()
            .parse::<f64>()
            .map_err(|e| KbpoError::Validation(format!("malformed confidence '{}': {e}", parts[7])))?;
        Ok(Self {
            query_id: parts[0].to_string(),
            relation: parts[1].to_string(),
            run_id: parts[2].to_string(),
            relation_provenances: spans(parts[3]),
            slot_value: parts[4].to_string(),
            slot_type: parts[5].to_string(),
            slot_provenances: spans(parts[6]),
            confidence,
        })
    }
}

/// Slot filling query id → query entity
pub type QueryMap = BTreeMap<String, String>;

/// Read `<entity query> <slot filling query> ...` lines
pub fn read_queries<R: BufRead>(reader: R) -> Result<QueryMap> {
    let mut queries = QueryMap::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| KbpoError::Other(e.into()))?;
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(entity), Some(query)) => {
                queries.insert(query.to_string(), entity.to_string());
            }
            (None, _) => continue,
            _ => {
                return Err(KbpoError::Validation(format!(
                    "query line {}: expected two columns",
                    i + 1
                )))
            }
        }
    }
    Ok(queries)
}

fn read_entries<R: BufRead, T>(
    reader: R,
    parse: impl Fn(&str) -> Result<T>,
    keep: impl Fn(&T) -> bool,
) -> Result<Vec<T>> {
    let mut entries = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| KbpoError::Other(e.into()))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = parse(&line).map_err(|e| KbpoError::Validation(format!("line {}: {e}", i + 1)))?;
        if keep(&entry) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Gold entries of the evaluated queries
pub fn read_gold<R: BufRead>(reader: R, queries: &QueryMap) -> Result<Vec<GoldEntry>> {
    let gold = read_entries(reader, GoldEntry::from_line, |e| queries.contains_key(&e.query_id))?;
    info!(entries = gold.len(), "loaded evaluation entries");
    Ok(gold)
}

/// Output entries of the evaluated queries
pub fn read_output<R: BufRead>(reader: R, queries: &QueryMap) -> Result<Vec<OutputEntry>> {
    let output =
        read_entries(reader, OutputEntry::from_line, |e| queries.contains_key(&e.query_id))?;
    debug!(entries = output.len(), "loaded output entries");
    Ok(output)
}

// ============================================================================
// Counts
// ============================================================================

/// Matching key of an entry under a mode
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryKey {
    pub entity: String,
    pub provenance: Option<String>,
    pub slot_value: String,
}

fn entry_key(
    entity: &str,
    provenances: &[String],
    slot_value: &str,
    mode: PoolingMode,
) -> EntryKey {
    EntryKey {
        entity: entity.to_string(),
        provenance: if mode.uses_provenance() {
            provenances.first().cloned()
        } else {
            None
        },
        slot_value: slot_value.to_string(),
    }
}

fn gold_key(entry: &GoldEntry, queries: &QueryMap, mode: PoolingMode) -> Option<EntryKey> {
    let entity = queries.get(&entry.query_id)?;
    Some(entry_key(entity, &entry.relation_provenances, &entry.slot_value, mode))
}

fn output_key(entry: &OutputEntry, queries: &QueryMap, mode: PoolingMode) -> Option<EntryKey> {
    let entity = queries.get(&entry.query_id)?;
    Some(entry_key(entity, &entry.relation_provenances, &entry.slot_value, mode))
}

/// `S`, `C` and `T` of one query entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCount {
    pub entity: String,
    pub submitted: f64,
    pub correct: f64,
    pub total: f64,
}

impl EntityCount {
    pub fn score(&self) -> Score {
        micro([self])
    }
}

/// Per-entity counts of one run against a gold pool
pub fn entity_counts(
    gold: &[GoldEntry],
    output: &[OutputEntry],
    queries: &QueryMap,
    mode: PoolingMode,
) -> Vec<EntityCount> {
    // Conflicting labels for one key keep the larger class
    let mut labels: BTreeMap<EntryKey, u32> = BTreeMap::new();
    let mut entities: BTreeSet<String> = BTreeSet::new();
    for entry in gold {
        let Some(key) = gold_key(entry, queries, mode) else {
            continue;
        };
        entities.insert(key.entity.clone());
        let label = labels.entry(key).or_insert(entry.eq);
        *label = (*label).max(entry.eq);
    }

    let mut submitted: BTreeMap<&str, BTreeSet<EntryKey>> = BTreeMap::new();
    for entry in output {
        let Some(key) = output_key(entry, queries, mode) else {
            continue;
        };
        if mode.is_condensed() && !labels.contains_key(&key) {
            continue;
        }
        if let Some(entity) = entities.get(&key.entity) {
            submitted.entry(entity.as_str()).or_default().insert(key);
        }
    }

    entities
        .iter()
        .map(|entity| {
            let classes: BTreeSet<u32> = labels
                .iter()
                .filter(|(k, &f)| &k.entity == entity && f > 0)
                .map(|(_, &f)| f)
                .collect();
            let keys = submitted.get(entity.as_str());
            let found: BTreeSet<u32> = keys
                .into_iter()
                .flatten()
                .filter_map(|k| labels.get(k).copied())
                .filter(|&f| f > 0)
                .collect();
            EntityCount {
                entity: entity.clone(),
                submitted: keys.map(|k| k.len()).unwrap_or(0) as f64,
                correct: found.len() as f64,
                total: classes.len() as f64,
            }
        })
        .collect()
}

/// Scores over pooled counts
pub fn micro<'a>(counts: impl IntoIterator<Item = &'a EntityCount>) -> Score {
    let (s, c, t) = counts.into_iter().fold((0.0, 0.0, 0.0), |(s, c, t), e| {
        (s + e.submitted, c + e.correct, t + e.total)
    });
    let p = if s > 0.0 { c / s } else { 0.0 };
    let r = if t > 0.0 { c / t } else { 0.0 };
    let f1 = if c > 0.0 { f1_score(p, r) } else { 0.0 };
    Score::with_f1(p, r, f1)
}

/// Average of per-entity scores
pub fn macro_average<'a>(counts: impl IntoIterator<Item = &'a EntityCount>) -> Score {
    let mut n = 0.0;
    let (mut p, mut r, mut f1) = (0.0, 0.0, 0.0);
    for e in counts {
        let s = e.score();
        n += 1.0;
        p += (s.precision - p) / n;
        r += (s.recall - r) / n;
        f1 += (s.f1 - f1) / n;
    }
    Score::with_f1(p, r, f1)
}

/// Micro and macro scores side by side
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AveragedScore {
    pub micro: Score,
    pub r#macro: Score,
}

impl AveragedScore {
    pub fn of(counts: &[EntityCount]) -> Self {
        Self {
            micro: micro(counts),
            r#macro: macro_average(counts),
        }
    }

    fn to_vec(self) -> Vec<f64> {
        vec![
            self.micro.precision,
            self.micro.recall,
            self.micro.f1,
            self.r#macro.precision,
            self.r#macro.recall,
            self.r#macro.f1,
        ]
    }
}

/// Bootstrap intervals over query entities, in the order micro P/R/F1,
/// macro P/R/F1
pub fn entity_intervals(
    counts: &[EntityCount],
    bootstrap: &Bootstrap,
    sampler: &mut Sampler,
) -> Vec<Interval> {
    bootstrap.intervals(counts, sampler, |draw| {
        AveragedScore {
            micro: micro(draw.iter().copied()),
            r#macro: macro_average(draw.iter().copied()),
        }
        .to_vec()
    })
}

// ============================================================================
// Pooling Bias
// ============================================================================

/// Team of a run: `SF_UMass_IESL1` belongs to `UMass_IESL`
pub fn team_id(run_id: &str) -> &str {
    let tail = run_id.split_once('_').map(|(_, t)| t).unwrap_or(run_id);
    match tail.char_indices().next_back() {
        Some((i, _)) => &tail[..i],
        None => tail,
    }
}

/// Gold entries also produced by at least one run accepted by `include`
fn restricted_pool(
    gold: &[GoldEntry],
    outputs: &BTreeMap<String, Vec<OutputEntry>>,
    queries: &QueryMap,
    mode: PoolingMode,
    include: impl Fn(&str) -> bool,
) -> Vec<GoldEntry> {
    let valid: BTreeSet<EntryKey> = outputs
        .iter()
        .filter(|(run_id, _)| include(run_id))
        .flat_map(|(_, output)| output.iter())
        .filter_map(|entry| output_key(entry, queries, mode))
        .collect();
    gold.iter()
        .filter(|entry| {
            gold_key(entry, queries, mode)
                .map(|k| valid.contains(&k))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Gold restricted to entries some other run produced
pub fn leave_one_out_pool(
    gold: &[GoldEntry],
    outputs: &BTreeMap<String, Vec<OutputEntry>>,
    queries: &QueryMap,
    mode: PoolingMode,
    run_id: &str,
) -> Vec<GoldEntry> {
    restricted_pool(gold, outputs, queries, mode, |other| other != run_id)
}

/// Gold restricted to entries some run of another team produced
pub fn leave_team_out_pool(
    gold: &[GoldEntry],
    outputs: &BTreeMap<String, Vec<OutputEntry>>,
    queries: &QueryMap,
    mode: PoolingMode,
    run_id: &str,
) -> Vec<GoldEntry> {
    let team = team_id(run_id);
    restricted_pool(gold, outputs, queries, mode, |other| team_id(other) != team)
}

/// Scores of one run on the full, leave-one-out and leave-team-out pools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolingBias {
    pub run_id: String,
    pub pooled: AveragedScore,
    pub leave_one_out: AveragedScore,
    pub leave_team_out: AveragedScore,
}

/// Pooling bias of every run
pub fn pooling_bias(
    gold: &[GoldEntry],
    outputs: &BTreeMap<String, Vec<OutputEntry>>,
    queries: &QueryMap,
    mode: PoolingMode,
) -> Vec<PoolingBias> {
    outputs
        .iter()
        .map(|(run_id, output)| {
            let loo = leave_one_out_pool(gold, outputs, queries, mode, run_id);
            let lto = leave_team_out_pool(gold, outputs, queries, mode, run_id);
            let row = PoolingBias {
                run_id: run_id.clone(),
                pooled: AveragedScore::of(&entity_counts(gold, output, queries, mode)),
                leave_one_out: AveragedScore::of(&entity_counts(&loo, output, queries, mode)),
                leave_team_out: AveragedScore::of(&entity_counts(&lto, output, queries, mode)),
            };
            debug!(
                run_id = %run_id,
                loo_gold = loo.len(),
                lto_gold = lto.len(),
                "computed pooling bias"
            );
            row
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gold(id: &str, query: &str, prov: &str, value: &str, eq: u32) -> GoldEntry {
        GoldEntry::from_line(&format!(
            "{id}\t{query}:per:title\t{prov}\t{value}\t{prov}\tC\tC\t{query}:{eq}"
        ))
        .unwrap()
    }

    fn output(query: &str, run: &str, prov: &str, value: &str) -> OutputEntry {
        OutputEntry::from_line(&format!(
            "{query}\tper:title\t{run}\t{prov}\t{value}\tSTRING\t{prov}\t1.0"
        ))
        .unwrap()
    }

    fn queries() -> QueryMap {
        read_queries("E1 Q1\nE2 Q2\n".as_bytes()).unwrap()
    }

    #[test]
    fn test_parse_lines() {
        let line = "CS15_ENG_0016_0_001\tCS15_ENG_0016:gpe:births_in_country\tENG_NW_001278:1448-1584\tAgriculture\tENG_NW_001278:1505-1515\tW\tW\t0";
        let entry = GoldEntry::from_line(line).unwrap();
        assert_eq!(entry.query_id, "CS15_ENG_0016");
        assert_eq!(entry.relation, "gpe:births_in_country");
        assert_eq!(entry.relation_provenances, vec!["ENG_NW_001278:1448-1584"]);
        assert_eq!(entry.eq, 0);

        let line = "CSSF15_ENG_001e2aa16f\tgpe:births_in_city\tKB_BBN1\tNYT_ENG_20130513.0090:2476-2540\tKenneth Everette Battelle\tPER\tNYT_ENG_20130513.0090:2476-2500\t0.9";
        let entry = OutputEntry::from_line(line).unwrap();
        assert_eq!(entry.run_id, "KB_BBN1");
        assert_eq!(entry.slot_type, "PER");
        assert!((entry.confidence - 0.9).abs() < 1e-12);

        assert!(OutputEntry::from_line("too\tfew").is_err());
    }

    #[test]
    fn test_team_id() {
        assert_eq!(team_id("SF_UMass_IESL1"), "UMass_IESL");
        assert_eq!(team_id("KB_BBN1"), "BBN");
        assert_eq!(team_id("run2"), "run");
        assert_eq!(team_id(""), "");
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("condensed_anydoc".parse::<PoolingMode>().unwrap(), PoolingMode::CondensedAnydoc);
        assert!("open-world".parse::<PoolingMode>().is_err());
        assert!(!PoolingMode::Anydoc.uses_provenance());
    }

    #[test]
    fn test_entity_counts() {
        let q = queries();
        let gold = vec![
            gold("g1", "Q1", "d:0-5", "CEO", 1),
            gold("g2", "Q1", "d:6-9", "chairman", 2),
            gold("g3", "Q1", "d:10-15", "janitor", 0),
            gold("g4", "Q2", "d:0-5", "mayor", 1),
        ];
        let out = vec![
            output("Q1", "X_A1", "d:0-5", "CEO"),
            output("Q1", "X_A1", "d:10-15", "janitor"),
            output("Q1", "X_A1", "e:0-5", "pilot"),
        ];
        let counts = entity_counts(&gold, &out, &q, PoolingMode::ClosedWorld);
        assert_eq!(counts.len(), 2);
        assert_eq!((counts[0].submitted, counts[0].correct, counts[0].total), (3.0, 1.0, 2.0));
        assert_eq!((counts[1].submitted, counts[1].correct, counts[1].total), (0.0, 0.0, 1.0));

        let m = micro(&counts);
        assert!((m.precision - 1.0 / 3.0).abs() < 1e-12);
        assert!((m.recall - 1.0 / 3.0).abs() < 1e-12);
        let a = macro_average(&counts);
        assert!((a.precision - 1.0 / 6.0).abs() < 1e-12);
        assert!((a.recall - 0.25).abs() < 1e-12);

        // Condensed drops the unjudged "pilot"
        let condensed = entity_counts(&gold, &out, &q, PoolingMode::Condensed);
        assert_eq!(condensed[0].submitted, 2.0);
    }

    #[test]
    fn test_anydoc_ignores_provenance() {
        let q = queries();
        let gold = vec![gold("g1", "Q1", "d:0-5", "CEO", 1)];
        let out = vec![output("Q1", "X_A1", "other:0-5", "CEO")];
        let closed = entity_counts(&gold, &out, &q, PoolingMode::ClosedWorld);
        assert_eq!(closed[0].correct, 0.0);
        let anydoc = entity_counts(&gold, &out, &q, PoolingMode::Anydoc);
        assert_eq!(anydoc[0].correct, 1.0);
    }

    #[test]
    fn test_conflicting_labels_keep_larger_class() {
        let q = queries();
        let gold = vec![
            gold("g1", "Q1", "d:0-5", "CEO", 0),
            gold("g2", "Q1", "d:0-5", "CEO", 3),
        ];
        let out = vec![output("Q1", "X_A1", "d:0-5", "CEO")];
        let counts = entity_counts(&gold, &out, &q, PoolingMode::ClosedWorld);
        assert_eq!((counts[0].correct, counts[0].total), (1.0, 1.0));
    }

    #[test]
    fn test_leave_team_out_drops_team_only_fact() {
        let q = queries();
        // "CEO" is found only by the two runs of team T
        let gold = vec![
            gold("g1", "Q1", "d:0-5", "CEO", 1),
            gold("g2", "Q1", "d:6-9", "chairman", 2),
        ];
        let outputs: BTreeMap<String, Vec<OutputEntry>> = [
            ("SF_T1", vec![output("Q1", "SF_T1", "d:0-5", "CEO")]),
            ("SF_T2", vec![output("Q1", "SF_T2", "d:0-5", "CEO")]),
            ("SF_U1", vec![output("Q1", "SF_U1", "d:6-9", "chairman")]),
        ]
        .into_iter()
        .map(|(run, out)| (run.to_string(), out))
        .collect();
        let ids = |pool: &[GoldEntry]| pool.iter().map(|g| g.id.clone()).collect::<Vec<_>>();
        let mode = PoolingMode::ClosedWorld;

        // Another run of the same team keeps the fact in the pool
        let loo = leave_one_out_pool(&gold, &outputs, &q, mode, "SF_T1");
        assert_eq!(ids(&loo), vec!["g1", "g2"]);
        let lto = leave_team_out_pool(&gold, &outputs, &q, mode, "SF_T1");
        assert_eq!(ids(&lto), vec!["g2"]);
        let lto = leave_team_out_pool(&gold, &outputs, &q, mode, "SF_U1");
        assert_eq!(ids(&lto), vec!["g1"]);

        let rows = pooling_bias(&gold, &outputs, &q, mode);
        assert_eq!(rows.len(), 3);
        for row in &rows {
            assert!(row.leave_team_out.micro.recall <= row.pooled.micro.recall);
        }
        let t1 = rows.iter().find(|r| r.run_id == "SF_T1").unwrap();
        assert!((t1.pooled.micro.recall - 0.5).abs() < 1e-12);
        assert!((t1.leave_one_out.micro.recall - 0.5).abs() < 1e-12);
        assert_eq!(t1.leave_team_out.micro.recall, 0.0);
        let u1 = rows.iter().find(|r| r.run_id == "SF_U1").unwrap();
        assert!((u1.pooled.micro.recall - 0.5).abs() < 1e-12);
        assert_eq!(u1.leave_team_out.micro.recall, 0.0);
    }

    #[test]
    fn test_entity_intervals() {
        let counts: Vec<EntityCount> = (0..20)
            .map(|i| EntityCount {
                entity: format!("E{i}"),
                submitted: 4.0,
                correct: (i % 3) as f64,
                total: 3.0,
            })
            .collect();
        let bootstrap = Bootstrap::new(200, 0.95).unwrap();
        let intervals = entity_intervals(&counts, &bootstrap, &mut Sampler::seeded(9));
        assert_eq!(intervals.len(), 6);
        let point = micro(&counts);
        assert!(intervals[0].contains(point.precision));
        assert!(intervals[1].contains(point.recall));
    }
}
