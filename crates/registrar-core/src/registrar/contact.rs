//! Contact construction, in-memory merge and list positioning

use uuid::Uuid;

use crate::config::ContactOrder;
use crate::error::{RegistrarError, Result};
use crate::types::{Contact, ContactInfo, ContactState};

/// Build a `New` contact from registration info.
///
/// A missing ruid is generated; an explicitly empty one is rejected.
pub fn new_contact(domain: &str, aor: &str, uri: &str, info: &ContactInfo) -> Result<Contact> {
    if uri.is_empty() {
        return Err(RegistrarError::InvalidContact(format!(
            "empty contact uri for aor {}",
            aor
        )));
    }
    let ruid = match &info.ruid {
        Some(ruid) if ruid.is_empty() => {
            return Err(RegistrarError::InvalidContact(format!(
                "no ruid for aor {}",
                aor
            )))
        }
        Some(ruid) => ruid.clone(),
        None => generate_ruid(),
    };

    Ok(Contact {
        domain: domain.to_string(),
        aor: aor.to_string(),
        uri: uri.to_string(),
        callid: info.callid.clone().unwrap_or_default(),
        cseq: info.cseq,
        q: info.q,
        expires: info.expires,
        last_modified: info.last_modified,
        received: non_empty(&info.received),
        path: non_empty(&info.path),
        user_agent: info.user_agent.clone(),
        methods: info.methods,
        flags: info.flags,
        cflags: info.cflags,
        socket: info.socket.clone(),
        ruid,
        instance: non_empty(&info.instance),
        reg_id: info.reg_id,
        state: ContactState::New,
    })
}

/// Fresh record-unique id
pub fn generate_ruid() -> String {
    format!("ulcx-{}", Uuid::new_v4().simple())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

/// Merge new registration info into an existing contact
pub fn merge_info(contact: &mut Contact, info: &ContactInfo) {
    if info.instance.as_deref().map_or(false, |i| !i.is_empty()) {
        if let Some(uri) = info.uri.as_ref().filter(|u| !u.is_empty()) {
            contact.uri = uri.clone();
        }
    }
    if let Some(callid) = info.callid.as_ref().filter(|c| !c.is_empty()) {
        contact.callid = callid.clone();
    }
    contact.user_agent = info.user_agent.clone();
    contact.received = non_empty(&info.received);
    contact.path = non_empty(&info.path);
    contact.socket = info.socket.clone();
    contact.expires = info.expires;
    contact.q = info.q;
    contact.cseq = info.cseq;
    contact.methods = info.methods;
    contact.last_modified = info.last_modified;
    contact.flags = info.flags;
    contact.cflags = info.cflags;
}

/// Index at which `contact` belongs in `contacts`.
///
/// q order: before the first contact with a strictly greater q, so equal q
/// keeps arrival order. Time order: before the first contact modified no
/// later than `contact`, so the newest is first.
pub fn insert_position(contacts: &[Contact], contact: &Contact, order: ContactOrder) -> usize {
    match order {
        ContactOrder::QValue => contacts
            .iter()
            .position(|c| c.q > contact.q)
            .unwrap_or(contacts.len()),
        ContactOrder::LastModifiedDesc => contacts
            .iter()
            .position(|c| c.last_modified <= contact.last_modified)
            .unwrap_or(contacts.len()),
    }
}

/// Insert keeping the configured order; returns the index used
pub fn insert_sorted(contacts: &mut Vec<Contact>, contact: Contact, order: ContactOrder) -> usize {
    let pos = insert_position(contacts, &contact, order);
    contacts.insert(pos, contact);
    pos
}

fn in_place(contacts: &[Contact], idx: usize, order: ContactOrder) -> bool {
    let c = &contacts[idx];
    let prev = idx.checked_sub(1).map(|i| &contacts[i]);
    let next = contacts.get(idx + 1);
    match order {
        ContactOrder::QValue => {
            prev.map_or(true, |p| p.q <= c.q) && next.map_or(true, |n| c.q <= n.q)
        }
        ContactOrder::LastModifiedDesc => {
            prev.map_or(true, |p| p.last_modified >= c.last_modified)
                && next.map_or(true, |n| c.last_modified >= n.last_modified)
        }
    }
}

/// Move the contact at `idx` after its sort key changed; returns its new index
pub fn reposition(contacts: &mut Vec<Contact>, idx: usize, order: ContactOrder) -> usize {
    if in_place(contacts, idx, order) {
        return idx;
    }
    let contact = contacts.remove(idx);
    insert_sorted(contacts, contact, order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(uri: &str, q: f32, last_modified: i64) -> Contact {
        new_contact(
            "location",
            "alice",
            uri,
            &ContactInfo::new(0, "cid", 1)
                .with_q(q)
                .with_last_modified(last_modified),
        )
        .unwrap()
    }

    #[test]
    fn test_new_contact_state_and_ruid() {
        let c = contact("sip:a@1", 0.5, 10);
        assert_eq!(c.state(), ContactState::New);
        assert!(c.ruid.starts_with("ulcx-"));

        let bad = new_contact(
            "location",
            "alice",
            "sip:a@1",
            &ContactInfo::new(0, "cid", 1).with_ruid(""),
        );
        assert!(matches!(bad, Err(RegistrarError::InvalidContact(_))));
        assert!(new_contact("location", "alice", "", &ContactInfo::default()).is_err());
    }

    #[test]
    fn test_q_order_is_stable() {
        let mut list = Vec::new();
        insert_sorted(&mut list, contact("sip:a", 0.5, 0), ContactOrder::QValue);
        insert_sorted(&mut list, contact("sip:b", 0.1, 0), ContactOrder::QValue);
        insert_sorted(&mut list, contact("sip:c", 0.5, 0), ContactOrder::QValue);
        insert_sorted(&mut list, contact("sip:d", 1.0, 0), ContactOrder::QValue);
        let uris: Vec<_> = list.iter().map(|c| c.uri.as_str()).collect();
        assert_eq!(uris, ["sip:b", "sip:a", "sip:c", "sip:d"]);
    }

    #[test]
    fn test_time_order_newest_first() {
        let mut list = Vec::new();
        for (uri, t) in [("sip:a", 10), ("sip:b", 30), ("sip:c", 20)] {
            insert_sorted(&mut list, contact(uri, 0.0, t), ContactOrder::LastModifiedDesc);
        }
        let uris: Vec<_> = list.iter().map(|c| c.uri.as_str()).collect();
        assert_eq!(uris, ["sip:b", "sip:c", "sip:a"]);
    }

    #[test]
    fn test_reposition_after_q_change() {
        let mut list = Vec::new();
        for (uri, q) in [("sip:a", 0.2), ("sip:b", 0.5), ("sip:c", 0.7)] {
            insert_sorted(&mut list, contact(uri, q, 0), ContactOrder::QValue);
        }
        list[0].q = 0.9;
        let idx = reposition(&mut list, 0, ContactOrder::QValue);
        assert_eq!(idx, 2);
        assert_eq!(list[2].uri, "sip:a");

        // already in place, nothing moves
        list[1].q = 0.6;
        assert_eq!(reposition(&mut list, 1, ContactOrder::QValue), 1);
    }

    #[test]
    fn test_merge_keeps_uri_without_instance() {
        let mut c = contact("sip:a@1", 0.5, 0);
        let mut info = ContactInfo::new(3600, "", 2).with_q(0.8).with_path("<sip:p>");
        info.uri = Some("sip:a@2".into());
        merge_info(&mut c, &info);
        assert_eq!(c.uri, "sip:a@1");
        assert_eq!(c.callid, "cid");
        assert_eq!(c.cseq, 2);
        assert_eq!(c.path.as_deref(), Some("<sip:p>"));

        let info = info.with_instance("<urn:uuid:1>", 1);
        merge_info(&mut c, &info);
        assert_eq!(c.uri, "sip:a@2");
        assert_eq!(c.received, None);
    }
}
