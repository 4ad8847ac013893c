use crate::import::resolve::CardQuery;
use crate::models::ProposedValues;
use csv::StringRecord;
use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_CONDITION: &str = "NM";
pub const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Name,
    Set,
    CollectorNumber,
    Quantity,
    Condition,
    Foil,
    Language,
}

/// Accepted header spellings per field, in lookup priority.
const SYNONYMS: &[(Field, &[&str])] = &[
    (Field::Name, &["name"]),
    (Field::Set, &["set"]),
    (Field::CollectorNumber, &["collector_number", "cn"]),
    (Field::Quantity, &["quantity", "qty"]),
    (Field::Condition, &["condition"]),
    (Field::Foil, &["foil"]),
    (Field::Language, &["language"]),
];

/// Lowercases, trims, and folds whitespace/dash/underscore runs into a single
/// underscore, so `Collector Number` and `collector_number` are the same column.
pub fn normalize_header(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Header-derived lookup from logical field to column positions. Built once per
/// import and shared read-only by every resolver worker.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    header: StringRecord,
    columns: HashMap<Field, Vec<usize>>,
}

impl ColumnMap {
    pub fn from_header(header: &StringRecord) -> Self {
        let mut positions: HashMap<String, usize> = HashMap::new();
        for (idx, raw) in header.iter().enumerate() {
            positions.entry(normalize_header(raw)).or_insert(idx);
        }
        let columns = SYNONYMS
            .iter()
            .map(|(field, names)| {
                let found = names
                    .iter()
                    .filter_map(|name| positions.get(*name).copied())
                    .collect::<Vec<_>>();
                (*field, found)
            })
            .collect();
        Self {
            header: header.clone(),
            columns,
        }
    }

    pub fn has(&self, field: Field) -> bool {
        self.columns.get(&field).is_some_and(|c| !c.is_empty())
    }

    /// Whether any row could resolve at all: a name column, or both set and
    /// collector number.
    pub fn identifies_cards(&self) -> bool {
        self.has(Field::Name) || (self.has(Field::Set) && self.has(Field::CollectorNumber))
    }

    /// First non-empty trimmed value among the field's columns; empty when the
    /// column is absent or the row is short.
    pub fn value<'r>(&self, row: &'r StringRecord, field: Field) -> &'r str {
        self.columns
            .get(&field)
            .into_iter()
            .flatten()
            .filter_map(|idx| row.get(*idx))
            .map(str::trim)
            .find(|value| !value.is_empty())
            .unwrap_or("")
    }

    pub fn normalize(&self, row: &StringRecord) -> NormalizedRow {
        let quantity = self
            .value(row, Field::Quantity)
            .parse::<i64>()
            .ok()
            .filter(|q| *q >= 1)
            .unwrap_or(1);
        let condition = non_empty_or(self.value(row, Field::Condition), DEFAULT_CONDITION);
        let language = non_empty_or(self.value(row, Field::Language), DEFAULT_LANGUAGE);
        let is_foil = self.value(row, Field::Foil).eq_ignore_ascii_case("true");

        NormalizedRow {
            query: CardQuery {
                name: self.value(row, Field::Name).to_string(),
                set_code: self.value(row, Field::Set).to_string(),
                collector_number: self.value(row, Field::CollectorNumber).to_string(),
            },
            proposed: ProposedValues {
                quantity,
                condition,
                is_foil,
                language,
            },
        }
    }

    /// The row keyed by the header exactly as it appeared in the file.
    pub fn raw_record(&self, row: &StringRecord) -> BTreeMap<String, String> {
        self.header
            .iter()
            .zip(row.iter())
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRow {
    pub query: CardQuery,
    pub proposed: ProposedValues,
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}
