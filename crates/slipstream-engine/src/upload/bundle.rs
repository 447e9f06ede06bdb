//! Upload bundles and their peer-driven command parsing
//!
//! A downloader groups its queued files into bundles and keeps the uploader
//! informed through `UBD` (add / change / update / finish / remove) and
//! `UBN` (progress) commands, so the uploading side can show aggregate
//! progress. The commands arrive as pre-split ADC parameter lists with
//! two-letter prefixes.

use slipstream_core::Segment;

use super::ConnectionId;

/// One peer-announced bundle on the upload side
#[derive(Clone, Debug)]
pub struct UploadBundle {
    pub token: String,
    /// Directory hint derived from the bundle name
    pub target: String,
    pub size: i64,
    /// Bytes the peer reported as already downloaded via other sources
    pub uploaded_segments: i64,
    /// Bytes finished through our own uploads
    pub uploaded: i64,
    pub single_user: bool,
    /// Peer-reported aggregate speed (multi-source bundles)
    pub total_speed: u64,
    /// Our own measured speed over the attached uploads
    pub speed: u64,
    /// Seconds the bundle has sat without any upload attached
    pub delay_ticks: u32,
    pub uploads: Vec<ConnectionId>,
}

impl UploadBundle {
    pub fn new(name: &str, token: String, size: i64, single_user: bool, downloaded: i64) -> Self {
        let mut bundle = Self {
            token,
            target: String::new(),
            size,
            uploaded_segments: 0,
            uploaded: 0,
            single_user,
            total_speed: 0,
            speed: 0,
            delay_ticks: 0,
            uploads: Vec::new(),
        };
        if single_user {
            bundle.uploaded_segments = downloaded;
        }
        bundle.set_target(name);
        bundle
    }

    /// Directory-style bundle names keep their trailing separator
    pub fn set_target(&mut self, name: &str) {
        self.target = name.to_string();
    }

    pub fn name(&self) -> &str {
        self.target
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.target)
    }

    pub fn add_upload(&mut self, conn: ConnectionId) {
        if !self.uploads.contains(&conn) {
            self.uploads.push(conn);
            self.delay_ticks = 0;
        }
    }

    /// Remove an upload, crediting the bytes it moved; true when it was
    /// the last one
    pub fn remove_upload(&mut self, conn: ConnectionId, segment: &Segment) -> bool {
        if let Some(pos) = self.uploads.iter().position(|&c| c == conn) {
            self.uploads.remove(pos);
            self.uploaded += segment.size();
        }
        self.uploads.is_empty()
    }

    /// Switch between single- and multi-source accounting
    pub fn set_single_user(&mut self, single: bool, downloaded: i64) {
        self.single_user = single;
        if single {
            self.total_speed = 0;
            if downloaded > 0 {
                self.uploaded_segments = downloaded;
            }
        }
    }

    pub fn total_uploaded(&self) -> i64 {
        self.uploaded + self.uploaded_segments
    }

    /// Seconds until complete at the current rate
    pub fn seconds_left(&self) -> u64 {
        let speed = if self.single_user { self.speed } else { self.total_speed };
        if speed == 0 {
            return 0;
        }
        let left = (self.size - self.total_uploaded()).max(0) as u64;
        left / speed
    }
}

/// Parsed `UBD` subcommand
#[derive(Clone, Debug, PartialEq)]
pub enum BundleCommand {
    Add {
        bundle: String,
        conn_token: String,
        name: String,
        size: i64,
        downloaded: i64,
        single_user: bool,
    },
    Change {
        bundle: String,
        conn_token: String,
    },
    Update {
        bundle: String,
        name: Option<String>,
        size: Option<i64>,
        downloaded: i64,
        single_user: bool,
        multi_user: bool,
    },
    Finish {
        bundle: String,
    },
    Remove {
        conn_token: String,
    },
}

/// Parsed `UBN` progress report
#[derive(Clone, Debug, PartialEq)]
pub struct BundleProgress {
    pub bundle: String,
    pub speed: Option<u64>,
    pub percent: Option<f64>,
}

fn param<'a>(params: &'a [String], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find_map(|p| p.strip_prefix(key))
        .filter(|v| !v.is_empty())
}

fn has_flag(params: &[String], flag: &str) -> bool {
    params.iter().any(|p| p == flag)
}

/// Parse a `UBD` parameter list; None for malformed commands
pub fn parse_ubd(params: &[String]) -> Option<BundleCommand> {
    if has_flag(params, "AD") {
        let bundle = param(params, "BU")?.to_string();
        let conn_token = param(params, "TO")?.to_string();
        let name = param(params, "NA")?.to_string();
        let size: i64 = param(params, "SI")?.parse().ok()?;
        if size <= 0 {
            return None;
        }
        Some(BundleCommand::Add {
            bundle,
            conn_token,
            name,
            size,
            downloaded: param(params, "DL").and_then(|v| v.parse().ok()).unwrap_or(0),
            single_user: has_flag(params, "SU1") || param(params, "SU").is_some(),
        })
    } else if has_flag(params, "CH") {
        Some(BundleCommand::Change {
            bundle: param(params, "BU")?.to_string(),
            conn_token: param(params, "TO")?.to_string(),
        })
    } else if has_flag(params, "UD") {
        Some(BundleCommand::Update {
            bundle: param(params, "BU")?.to_string(),
            name: param(params, "NA").map(String::from),
            size: param(params, "SI").and_then(|v| v.parse().ok()),
            downloaded: param(params, "DL").and_then(|v| v.parse().ok()).unwrap_or(0),
            single_user: has_flag(params, "SU1"),
            multi_user: has_flag(params, "MU1"),
        })
    } else if has_flag(params, "FI") {
        Some(BundleCommand::Finish {
            bundle: param(params, "BU")?.to_string(),
        })
    } else if has_flag(params, "RM") {
        Some(BundleCommand::Remove {
            conn_token: param(params, "TO")?.to_string(),
        })
    } else {
        None
    }
}

/// Parse a `UBN` parameter list. Speeds come suffixed: `k`, `m`, or `b`.
pub fn parse_ubn(params: &[String]) -> Option<BundleProgress> {
    let bundle = param(params, "BU")?.to_string();

    let speed = param(params, "DS").and_then(|raw| {
        if raw.len() < 2 {
            return None;
        }
        let (value, unit) = raw.split_at(raw.len() - 1);
        let value: f64 = value.parse().ok()?;
        if value <= 0.0 {
            return None;
        }
        let multiplier = match unit {
            "k" => 1024.0,
            "m" => 1024.0 * 1024.0,
            "b" => 1.0,
            _ => return None,
        };
        Some((value * multiplier) as u64)
    });

    let percent = param(params, "PE")
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|p| (0.0..=100.0).contains(p));

    if speed.is_none() && percent.is_none() {
        return None;
    }
    Some(BundleProgress {
        bundle,
        speed,
        percent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_add() {
        let cmd = parse_ubd(&params(&[
            "AD",
            "BUbundle1",
            "TOconn7",
            "NAMy Album/",
            "SI1000000",
            "DL2048",
        ]))
        .unwrap();
        assert_eq!(
            cmd,
            BundleCommand::Add {
                bundle: "bundle1".into(),
                conn_token: "conn7".into(),
                name: "My Album/".into(),
                size: 1_000_000,
                downloaded: 2048,
                single_user: false,
            }
        );
    }

    #[test]
    fn test_parse_add_requires_fields() {
        assert!(parse_ubd(&params(&["AD", "BUb", "TOt", "NAx"])).is_none(), "no size");
        assert!(parse_ubd(&params(&["AD", "BUb", "TOt", "SI100"])).is_none(), "no name");
        assert!(
            parse_ubd(&params(&["AD", "BUb", "TOt", "NAx", "SI0"])).is_none(),
            "zero size"
        );
    }

    #[test]
    fn test_parse_update_and_finish() {
        let update = parse_ubd(&params(&["UD", "BUb1", "SI500", "MU1"])).unwrap();
        assert_eq!(
            update,
            BundleCommand::Update {
                bundle: "b1".into(),
                name: None,
                size: Some(500),
                downloaded: 0,
                single_user: false,
                multi_user: true,
            }
        );

        assert_eq!(
            parse_ubd(&params(&["FI", "BUb1"])).unwrap(),
            BundleCommand::Finish { bundle: "b1".into() }
        );
        assert_eq!(
            parse_ubd(&params(&["RM", "TOconn9"])).unwrap(),
            BundleCommand::Remove { conn_token: "conn9".into() }
        );
        assert!(parse_ubd(&params(&["BUb1"])).is_none(), "no action flag");
    }

    #[test]
    fn test_parse_ubn_speed_units() {
        let kb = parse_ubn(&params(&["BUb1", "DS100k"])).unwrap();
        assert_eq!(kb.speed, Some(100 * 1024));

        let mb = parse_ubn(&params(&["BUb1", "DS1.5m"])).unwrap();
        assert_eq!(mb.speed, Some((1.5 * 1024.0 * 1024.0) as u64));

        let bytes = parse_ubn(&params(&["BUb1", "DS900b"])).unwrap();
        assert_eq!(bytes.speed, Some(900));
    }

    #[test]
    fn test_parse_ubn_percent() {
        let progress = parse_ubn(&params(&["BUb1", "PE42.5"])).unwrap();
        assert_eq!(progress.percent, Some(42.5));
        assert!(parse_ubn(&params(&["BUb1", "PE150"])).is_none(), "percent out of range");
        assert!(parse_ubn(&params(&["BUb1"])).is_none(), "no payload");
    }

    #[test]
    fn test_bundle_accounting() {
        let mut bundle = UploadBundle::new("Albums/My Album/", "tok".into(), 1000, true, 100);
        assert_eq!(bundle.name(), "My Album");
        assert_eq!(bundle.total_uploaded(), 100);

        bundle.add_upload(1);
        bundle.add_upload(1);
        assert_eq!(bundle.uploads.len(), 1);

        let last = bundle.remove_upload(1, &Segment::new(0, 400));
        assert!(last);
        assert_eq!(bundle.total_uploaded(), 500);
    }

    #[test]
    fn test_single_user_switch() {
        let mut bundle = UploadBundle::new("X/", "tok".into(), 1000, false, 0);
        bundle.total_speed = 5000;

        bundle.set_single_user(true, 300);
        assert!(bundle.single_user);
        assert_eq!(bundle.total_speed, 0);
        assert_eq!(bundle.uploaded_segments, 300);
    }
}
