use std::collections::HashMap;

use super::entry::{AccountSpec, Mode};
use super::error::AccountError;

/// Specs in processing order, plus the duplicates that were dropped
#[derive(Debug, Default)]
pub struct OrderedSpecs {
    pub specs: Vec<AccountSpec>,
    pub duplicates: Vec<AccountError>,
}

/// Keep the first entry per username, then move deletions to the front.
/// Both partitions keep their original relative order. Each dropped
/// duplicate is logged at warn level here and returned in `duplicates`.
pub fn dedup_and_order(specs: Vec<AccountSpec>) -> OrderedSpecs {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut kept = Vec::with_capacity(specs.len());
    let mut duplicates = Vec::new();

    for spec in specs {
        if let Some(&first_line) = seen.get(&spec.username) {
            let err = AccountError::DuplicateUsername {
                username: spec.username.clone(),
                line: spec.line,
                first_line,
            };
            log::warn!("{}", err);
            duplicates.push(err);
            continue;
        }
        seen.insert(spec.username.clone(), spec.line);
        kept.push(spec);
    }

    let (mut ordered, rest): (Vec<_>, Vec<_>) = kept.into_iter().partition(|s| s.mode == Mode::Delete);
    ordered.extend(rest);

    OrderedSpecs {
        specs: ordered,
        duplicates,
    }
}
