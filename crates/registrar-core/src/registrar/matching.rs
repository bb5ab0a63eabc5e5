//! Contact matching
//!
//! Resolves a registration request to one of a record's contacts. Structural
//! matching depends on [`MatchingMode`]; once a contact is found, its stored
//! CSeq decides whether the request is a genuine update, a retransmission
//! or out of order.

use crate::config::MatchingMode;
use crate::types::{Contact, ContactInfo, MatchOutcome};

/// Request attributes used for matching
#[derive(Debug, Clone, Copy)]
pub struct MatchRequest<'a> {
    pub uri: &'a str,
    pub callid: Option<&'a str>,
    pub path: Option<&'a str>,
    pub cseq: u32,
}

impl<'a> MatchRequest<'a> {
    pub fn new(uri: &'a str, callid: Option<&'a str>, path: Option<&'a str>, cseq: u32) -> Self {
        Self {
            uri,
            callid,
            path,
            cseq,
        }
    }

    /// Request view of registration info for `uri`
    pub fn from_info(uri: &'a str, info: &'a ContactInfo) -> Self {
        Self::new(uri, info.callid.as_deref(), info.path.as_deref(), info.cseq)
    }
}

/// Window parameters for the CSeq check
#[derive(Debug, Clone, Copy)]
pub struct CseqWindow {
    pub delay: i64,
    pub now: i64,
}

fn path_eq(stored: &Option<String>, wanted: Option<&str>) -> bool {
    let wanted = wanted.filter(|p| !p.is_empty());
    stored.as_deref() == wanted
}

fn structural_match(mode: MatchingMode, c: &Contact, req: &MatchRequest<'_>) -> bool {
    if c.uri != req.uri {
        return false;
    }
    match mode {
        MatchingMode::ContactOnly => true,
        MatchingMode::ContactCallid => req.callid == Some(c.callid.as_str()),
        MatchingMode::ContactPath => path_eq(&c.path, req.path),
    }
}

fn check_cseq(c: &Contact, cseq: u32, window: CseqWindow) -> MatchOutcome {
    if cseq < c.cseq {
        return MatchOutcome::Invalid;
    }
    if cseq == c.cseq {
        if c.last_modified + window.delay > window.now {
            return MatchOutcome::Skip;
        }
        return MatchOutcome::Invalid;
    }
    MatchOutcome::Found(c.ruid.clone())
}

/// Find the contact a request refers to.
///
/// The CSeq is only compared when the Call-ID matches too; in
/// contact+callid mode that is always the case.
pub fn match_contact(
    contacts: &[Contact],
    mode: MatchingMode,
    req: &MatchRequest<'_>,
    window: CseqWindow,
) -> MatchOutcome {
    match contacts.iter().find(|c| structural_match(mode, c, req)) {
        Some(c) => sequence_check(c, mode, req, window),
        None => MatchOutcome::NotFound,
    }
}

/// CSeq verdict for a structurally matched contact; only applied within
/// the same Call-ID
fn sequence_check(
    c: &Contact,
    mode: MatchingMode,
    req: &MatchRequest<'_>,
    window: CseqWindow,
) -> MatchOutcome {
    let same_dialog = mode == MatchingMode::ContactCallid || req.callid == Some(c.callid.as_str());
    if same_dialog {
        check_cseq(c, req.cseq, window)
    } else {
        MatchOutcome::Found(c.ruid.clone())
    }
}

/// Strip the angle brackets an instance value is usually quoted with
pub fn normalize_instance(instance: &str) -> &str {
    let trimmed = instance.trim();
    trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed)
}

/// Match on `+sip.instance` and reg-id, falling back to [`match_contact`]
/// when the request carries no instance. A match is subject to the same
/// CSeq rules as an address match.
pub fn match_by_instance(
    contacts: &[Contact],
    mode: MatchingMode,
    req: &MatchRequest<'_>,
    instance: Option<&str>,
    reg_id: u32,
    window: CseqWindow,
) -> MatchOutcome {
    let wanted = match instance.map(normalize_instance) {
        Some(i) if !i.is_empty() => i,
        _ => return match_contact(contacts, mode, req, window),
    };
    contacts
        .iter()
        .find(|c| {
            c.reg_id == reg_id
                && c
                    .instance
                    .as_deref()
                    .map_or(false, |i| normalize_instance(i) == wanted)
        })
        .map_or(MatchOutcome::NotFound, |c| sequence_check(c, mode, req, window))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registrar::contact::new_contact;

    fn stored(uri: &str, callid: &str, cseq: u32, ruid: &str) -> Contact {
        new_contact(
            "location",
            "alice",
            uri,
            &ContactInfo::new(3600, callid, cseq)
                .with_ruid(ruid)
                .with_last_modified(1_000),
        )
        .unwrap()
    }

    const WINDOW: CseqWindow = CseqWindow {
        delay: 20,
        now: 1_005,
    };

    #[test]
    fn test_contact_only_cseq_rules() {
        let list = vec![stored("sip:a@1", "cid", 10, "r1")];
        let m = |cseq, callid| {
            match_contact(
                &list,
                MatchingMode::ContactOnly,
                &MatchRequest::new("sip:a@1", Some(callid), None, cseq),
                WINDOW,
            )
        };
        assert_eq!(m(11, "cid"), MatchOutcome::Found("r1".into()));
        assert_eq!(m(9, "cid"), MatchOutcome::Invalid);
        assert_eq!(m(10, "cid"), MatchOutcome::Skip);
        // other dialog: no cseq comparison
        assert_eq!(m(1, "other"), MatchOutcome::Found("r1".into()));
    }

    #[test]
    fn test_equal_cseq_outside_window_is_invalid() {
        let list = vec![stored("sip:a@1", "cid", 10, "r1")];
        let late = CseqWindow {
            delay: 20,
            now: 1_020,
        };
        let req = MatchRequest::new("sip:a@1", Some("cid"), None, 10);
        assert_eq!(
            match_contact(&list, MatchingMode::ContactOnly, &req, late),
            MatchOutcome::Invalid
        );
    }

    #[test]
    fn test_callid_mode_requires_callid() {
        let list = vec![
            stored("sip:a@1", "cid-1", 5, "r1"),
            stored("sip:a@1", "cid-2", 7, "r2"),
        ];
        let req = MatchRequest::new("sip:a@1", Some("cid-2"), None, 8);
        assert_eq!(
            match_contact(&list, MatchingMode::ContactCallid, &req, WINDOW),
            MatchOutcome::Found("r2".into())
        );
        let req = MatchRequest::new("sip:a@1", Some("cid-3"), None, 8);
        assert_eq!(
            match_contact(&list, MatchingMode::ContactCallid, &req, WINDOW),
            MatchOutcome::NotFound
        );
    }

    #[test]
    fn test_path_mode() {
        let mut with_path = stored("sip:a@1", "cid", 5, "r1");
        with_path.path = Some("<sip:edge1>".into());
        let list = vec![with_path, stored("sip:a@1", "cid", 5, "r2")];

        let req = MatchRequest::new("sip:a@1", Some("x"), Some("<sip:edge1>"), 1);
        assert_eq!(
            match_contact(&list, MatchingMode::ContactPath, &req, WINDOW),
            MatchOutcome::Found("r1".into())
        );
        let req = MatchRequest::new("sip:a@1", Some("x"), None, 1);
        assert_eq!(
            match_contact(&list, MatchingMode::ContactPath, &req, WINDOW),
            MatchOutcome::Found("r2".into())
        );
    }

    #[test]
    fn test_instance_match() {
        let mut c = stored("sip:a@1", "cid", 5, "r1");
        c.instance = Some("<urn:uuid:abc>".into());
        c.reg_id = 1;
        let list = vec![c];
        let req = MatchRequest::new("sip:a@changed", Some("cid"), None, 6);

        assert_eq!(
            match_by_instance(&list, MatchingMode::ContactOnly, &req, Some("urn:uuid:abc"), 1, WINDOW),
            MatchOutcome::Found("r1".into())
        );
        assert_eq!(
            match_by_instance(&list, MatchingMode::ContactOnly, &req, Some("<urn:uuid:abc>"), 2, WINDOW),
            MatchOutcome::NotFound
        );
        // no instance: plain matching on the uri
        assert_eq!(
            match_by_instance(&list, MatchingMode::ContactOnly, &req, None, 0, WINDOW),
            MatchOutcome::NotFound
        );
    }

    #[test]
    fn test_instance_match_checks_cseq() {
        let mut c = stored("sip:a@1", "cid", 5, "r1");
        c.instance = Some("<urn:uuid:abc>".into());
        c.reg_id = 1;
        let list = vec![c];
        let m = |cseq, callid| {
            match_by_instance(
                &list,
                MatchingMode::ContactOnly,
                &MatchRequest::new("sip:a@2", Some(callid), None, cseq),
                Some("<urn:uuid:abc>"),
                1,
                WINDOW,
            )
        };

        assert_eq!(m(5, "cid"), MatchOutcome::Skip);
        assert_eq!(m(3, "cid"), MatchOutcome::Invalid);
        assert_eq!(m(6, "cid"), MatchOutcome::Found("r1".into()));
        // a new dialog from the same device is an update
        assert_eq!(m(1, "cid-2"), MatchOutcome::Found("r1".into()));

        let late = CseqWindow {
            delay: 20,
            now: 1_020,
        };
        let req = MatchRequest::new("sip:a@2", Some("cid"), None, 5);
        assert_eq!(
            match_by_instance(&list, MatchingMode::ContactOnly, &req, Some("urn:uuid:abc"), 1, late),
            MatchOutcome::Invalid
        );
    }
}
