//! Internal serial-number verification, grounded on `Evaluator.checkISN` in
//! `original_source/evaluator.py`.

use std::collections::HashMap;

use super::{DbIsnTable, LiveIsnTable};

/// UUB number reserved for a not-yet-provisioned ("virgin") board running
/// under its factory MAC address.
pub const VIRGIN_UUBNUM: u32 = 9999;

/// Bitmask controlling which ISN mismatches are tolerated rather than
/// aborting the campaign, matching `Evaluator.ISN_SEVERITY_*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsnSeverity(pub u8);

impl IsnSeverity {
    pub const STRICT: IsnSeverity = IsnSeverity(0);
    pub const I2CFAIL: IsnSeverity = IsnSeverity(1);
    pub const NOTLIVE: IsnSeverity = IsnSeverity(2);
    pub const NODB: IsnSeverity = IsnSeverity(4);
    pub const REPORT: IsnSeverity = IsnSeverity(8);

    pub fn from_json(value: &serde_json::Value) -> Self {
        IsnSeverity(value.as_u64().unwrap_or(0) as u8)
    }

    fn allows(self, bit: IsnSeverity) -> bool {
        self.0 & bit.0 != 0
    }
}

pub struct IsnReport {
    pub passed: bool,
    pub should_abort: bool,
    pub lines: Vec<String>,
}

/// Reimplements `checkISN`'s branching exactly: a "virgin" run (a single
/// UUB paired with the sentinel [`VIRGIN_UUBNUM`]) compares against
/// whichever of the two is actually live, everything else compares each
/// known UUB's DB-stored ISN against its live readout.
pub fn check_isn(uubnums: &[Option<u32>], db_isn: &DbIsnTable, live_isn: &LiveIsnTable, severity: IsnSeverity) -> IsnReport {
    let luubnums: Vec<u32> = uubnums.iter().filter_map(|u| *u).collect();
    let is_virgin_run = luubnums.contains(&VIRGIN_UUBNUM);

    let mut testres = true;
    let mut lines = Vec::new();

    let nodb: Vec<u32> = luubnums.iter().copied().filter(|u| !db_isn.contains_key(u) && *u != VIRGIN_UUBNUM).collect();
    if !nodb.is_empty() {
        if !severity.allows(IsnSeverity::NODB) {
            testres = false;
        }
    }

    let i2cfail: Vec<u32> = luubnums
        .iter()
        .copied()
        .filter(|u| matches!(live_isn.get(u), Some(Err(()))))
        .collect();
    if !i2cfail.is_empty() && !severity.allows(IsnSeverity::I2CFAIL) {
        testres = false;
    }

    let notlive: Vec<u32> = luubnums
        .iter()
        .copied()
        .filter(|u| matches!(live_isn.get(u), Some(Ok(None)) | None))
        .collect();

    let mut virgin_live = false;
    if is_virgin_run {
        if notlive.is_empty() {
            lines.push("Seems both UUB and virgin live.".to_string());
        } else if notlive.len() == 2 {
            if !severity.allows(IsnSeverity::NOTLIVE) {
                testres = false;
            }
        } else {
            virgin_live = !notlive.contains(&VIRGIN_UUBNUM);
            if nodb.is_empty() && i2cfail.is_empty() {
                if let Some((uubnum, disn)) = db_isn.iter().next() {
                    let probe = if virgin_live { VIRGIN_UUBNUM } else { *uubnum };
                    if let Some(Ok(Some(uisn))) = live_isn.get(&probe) {
                        if uisn != disn {
                            testres = false;
                            lines.push(format!("ISN mismatch for UUB #{uubnum:04}, DB {disn} vs UUB {uisn}"));
                        }
                    }
                }
            }
        }
    } else {
        if !notlive.is_empty() && !severity.allows(IsnSeverity::NOTLIVE) {
            testres = false;
        }
        let excluded: std::collections::HashSet<u32> = nodb.iter().chain(i2cfail.iter()).chain(notlive.iter()).copied().collect();
        let mut invalid: Vec<(u32, &str, &str)> = Vec::new();
        for uubnum in &luubnums {
            if excluded.contains(uubnum) {
                continue;
            }
            if let (Some(disn), Some(Ok(Some(uisn)))) = (db_isn.get(uubnum), live_isn.get(uubnum)) {
                if disn != uisn {
                    invalid.push((*uubnum, disn.as_str(), uisn.as_str()));
                }
            }
        }
        if !invalid.is_empty() {
            testres = false;
            for (uubnum, disn, uisn) in invalid {
                lines.push(format!("ISN mismatch for UUB #{uubnum:04}, DB {disn} vs UUB {uisn}"));
            }
        }
    }

    let mut summary = vec![format!("Check of internal serial number(s) {}.", if testres { "passed" } else { "failed" })];
    if is_virgin_run {
        summary.push(format!("UUB running under {} MAC address.", if virgin_live { "original" } else { "changed" }));
    }
    let should_abort = !testres && !severity.allows(IsnSeverity::REPORT);
    if should_abort {
        summary.push("The test will be aborted now.".to_string());
    }
    summary.extend(lines);

    IsnReport {
        passed: testres,
        should_abort,
        lines: summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(u32, &str)]) -> DbIsnTable {
        pairs.iter().map(|(u, s)| (*u, s.to_string())).collect::<HashMap<_, _>>()
    }

    #[test]
    fn matching_isn_passes() {
        let uubnums = vec![Some(12)];
        let db = table(&[(12, "ABC123")]);
        let mut live: LiveIsnTable = HashMap::new();
        live.insert(12, Ok(Some("ABC123".to_string())));
        let report = check_isn(&uubnums, &db, &live, IsnSeverity::STRICT);
        assert!(report.passed);
        assert!(!report.should_abort);
    }

    #[test]
    fn mismatched_isn_aborts_under_strict_severity() {
        let uubnums = vec![Some(12)];
        let db = table(&[(12, "ABC123")]);
        let mut live: LiveIsnTable = HashMap::new();
        live.insert(12, Ok(Some("WRONG".to_string())));
        let report = check_isn(&uubnums, &db, &live, IsnSeverity::STRICT);
        assert!(!report.passed);
        assert!(report.should_abort);
    }

    #[test]
    fn report_only_severity_never_aborts() {
        let uubnums = vec![Some(12)];
        let db = table(&[(12, "ABC123")]);
        let mut live: LiveIsnTable = HashMap::new();
        live.insert(12, Ok(Some("WRONG".to_string())));
        let report = check_isn(&uubnums, &db, &live, IsnSeverity::REPORT);
        assert!(!report.passed);
        assert!(!report.should_abort);
    }
}
