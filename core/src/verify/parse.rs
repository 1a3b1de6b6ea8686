//! Parsers for the pipe-delimited lines the assessment queries print.

use crate::types::{ApplyState, DestinationState, DestinationStatus};

/// `DEST|id|status|error|destination` lines. Unparseable lines are ignored.
pub fn parse_destinations(stdout: &str) -> Vec<DestinationState> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("DEST|"))
        .filter_map(|rest| {
            let mut parts = rest.splitn(4, '|');
            let dest_id = parts.next()?.trim().parse().ok()?;
            let status = DestinationStatus::parse(parts.next()?);
            let error = parts.next().unwrap_or("").trim().to_string();
            let destination = parts.next().unwrap_or("").trim().to_string();
            Some(DestinationState {
                dest_id,
                destination,
                status,
                error,
            })
        })
        .collect()
}

/// `ROLE|role|open_mode`, `MRP|process|status` and `LAG|interval` lines.
/// Returns `None` when no role line was printed.
pub fn parse_apply(stdout: &str) -> Option<ApplyState> {
    let mut role: Option<(String, String)> = None;
    let mut mrp_status = None;
    let mut apply_lag_secs = None;

    for line in stdout.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("ROLE|") {
            let (r, mode) = rest.split_once('|').unwrap_or((rest, ""));
            role = Some((r.trim().to_string(), mode.trim().to_string()));
        } else if let Some(rest) = line.strip_prefix("MRP|") {
            if mrp_status.is_none() {
                let status = rest.split_once('|').map(|(_, s)| s).unwrap_or(rest).trim();
                if !status.is_empty() {
                    mrp_status = Some(status.to_string());
                }
            }
        } else if let Some(rest) = line.strip_prefix("LAG|") {
            apply_lag_secs = parse_interval_secs(rest);
        }
    }

    role.map(|(database_role, open_mode)| ApplyState {
        database_role,
        open_mode,
        mrp_status,
        apply_lag_secs,
    })
}

/// Oracle day-to-second interval text such as `+00 00:00:03` or
/// `+01 02:03:04.250`, rounded down to whole seconds.
pub fn parse_interval_secs(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let unsigned = raw.strip_prefix('+').unwrap_or(raw);
    if unsigned.is_empty() || unsigned.starts_with('-') {
        return None;
    }
    let (days, clock) = match unsigned.split_once(' ') {
        Some((d, c)) => (d.trim().parse::<u64>().ok()?, c.trim()),
        None => (0, unsigned),
    };
    let mut fields = clock.split(':');
    let hours: u64 = fields.next()?.parse().ok()?;
    let minutes: u64 = fields.next()?.parse().ok()?;
    let seconds = fields.next()?;
    if fields.next().is_some() {
        return None;
    }
    let whole = seconds.split('.').next()?.parse::<u64>().ok()?;
    days.checked_mul(86_400)?
        .checked_add(hours.checked_mul(3_600)?)?
        .checked_add(minutes.checked_mul(60)?)?
        .checked_add(whole)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_destination_rows() {
        let out = "\
DEST|1|VALID||USE_DB_RECOVERY_FILE_DEST
DEST|2|ERROR|ORA-12541: TNS:no listener|ORA2_STBY
some banner text
DEST|x|VALID||bogus
";
        let dests = parse_destinations(out);
        assert_eq!(dests.len(), 2);
        assert_eq!(dests[0].dest_id, 1);
        assert_eq!(dests[0].status, DestinationStatus::Valid);
        assert_eq!(dests[0].error, "");
        assert_eq!(dests[1].status, DestinationStatus::Error);
        assert_eq!(dests[1].error, "ORA-12541: TNS:no listener");
        assert_eq!(dests[1].destination, "ORA2_STBY");
    }

    #[test]
    fn parses_apply_state() {
        let out = "ROLE|PHYSICAL STANDBY|MOUNTED\nMRP|MRP0|APPLYING_LOG\nLAG|+00 00:00:00\n";
        let apply = parse_apply(out).unwrap();
        assert_eq!(apply.database_role, "PHYSICAL STANDBY");
        assert_eq!(apply.open_mode, "MOUNTED");
        assert_eq!(apply.mrp_status.as_deref(), Some("APPLYING_LOG"));
        assert_eq!(apply.apply_lag_secs, Some(0));
    }

    #[test]
    fn apply_without_mrp_or_lag() {
        let apply = parse_apply("ROLE|PRIMARY|READ WRITE\nLAG|\n").unwrap();
        assert_eq!(apply.mrp_status, None);
        assert_eq!(apply.apply_lag_secs, None);
        assert!(parse_apply("no rows selected").is_none());
    }

    #[test]
    fn interval_parsing() {
        assert_eq!(parse_interval_secs("+00 00:00:00"), Some(0));
        assert_eq!(parse_interval_secs("+00 00:01:05"), Some(65));
        assert_eq!(parse_interval_secs("+01 02:03:04.250"), Some(93_784));
        assert_eq!(parse_interval_secs("00:00:07"), Some(7));
        assert_eq!(parse_interval_secs(""), None);
        assert_eq!(parse_interval_secs("-00 00:00:01"), None);
        assert_eq!(parse_interval_secs("soon"), None);
    }

    #[test]
    fn oversized_interval_is_unparsed() {
        let huge = format!("+{} 00:00:00", u64::MAX / 1_000);
        assert_eq!(parse_interval_secs(&huge), None);
        assert_eq!(parse_interval_secs(&format!("{}:00:00", u64::MAX)), None);
        let apply = parse_apply(&format!("ROLE|PHYSICAL STANDBY|MOUNTED\nLAG|{}\n", huge)).unwrap();
        assert_eq!(apply.apply_lag_secs, None);
    }
}
