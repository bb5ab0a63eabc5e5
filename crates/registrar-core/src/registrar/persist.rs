//! Contact rows in the backing store
//!
//! [`ContactTable`] converts contacts to and from location-table rows and
//! builds the key conditions used to find a contact's row again.

use std::collections::HashSet;
use tracing::{debug, warn};

use crate::config::{ColumnNames, LocationConfig, MatchingMode};
use crate::error::{RegistrarError, Result};
use crate::storage::{CmpOp, Condition, DbRow, DbValue, LocationStore, QuerySpec};
use crate::types::{Contact, ContactInfo, SocketResolver, ALL_METHODS};

/// One contact row read back from the store
#[derive(Debug, Clone)]
pub struct LoadedContact {
    pub aor: String,
    pub uri: String,
    pub info: ContactInfo,
}

/// A domain's location table
#[derive(Clone, Copy)]
pub struct ContactTable<'a> {
    pub table: &'a str,
    pub store: &'a dyn LocationStore,
    pub config: &'a LocationConfig,
    pub resolver: Option<&'a dyn SocketResolver>,
}

/// Split an AOR into its user and domain parts
pub fn split_aor(aor: &str) -> (&str, &str) {
    match aor.split_once('@') {
        Some((user, domain)) => (user, domain),
        None => ("", aor),
    }
}

impl<'a> ContactTable<'a> {
    fn cols(&self) -> &'a ColumnNames {
        &self.config.columns
    }

    fn col(name: &str, value: DbValue) -> (String, DbValue) {
        (name.to_string(), value)
    }

    /// Conditions selecting every row of `aor`
    pub fn aor_keys(&self, aor: &str) -> Vec<Condition> {
        let cols = self.cols();
        if self.config.use_domain {
            let (user, domain) = split_aor(aor);
            vec![
                Condition::eq(cols.user.as_str(), DbValue::Str(user.to_string())),
                Condition::eq(cols.domain.as_str(), DbValue::Str(domain.to_string())),
            ]
        } else {
            vec![Condition::eq(cols.user.as_str(), DbValue::Str(aor.to_string()))]
        }
    }

    fn ruid_keys(&self, contact: &Contact) -> Result<Vec<Condition>> {
        if contact.ruid.is_empty() {
            return Err(RegistrarError::InvalidContact(format!(
                "contact {} of {} has no ruid",
                contact.uri, contact.aor
            )));
        }
        Ok(vec![Condition::eq(
            self.cols().ruid.as_str(),
            DbValue::Str(contact.ruid.clone()),
        )])
    }

    fn address_keys(&self, contact: &Contact) -> Vec<Condition> {
        let cols = self.cols();
        let mut keys = self.aor_keys(&contact.aor);
        keys.push(Condition::eq(
            cols.contact.as_str(),
            DbValue::Str(contact.uri.clone()),
        ));
        match self.config.matching_mode {
            MatchingMode::ContactOnly => {}
            MatchingMode::ContactCallid => keys.push(Condition::eq(
                cols.callid.as_str(),
                DbValue::Str(contact.callid.clone()),
            )),
            MatchingMode::ContactPath => keys.push(Condition::eq(
                cols.path.as_str(),
                DbValue::opt_str(contact.path.as_deref()),
            )),
        }
        keys
    }

    fn instance_keys(&self, contact: &Contact, instance: &str) -> Vec<Condition> {
        let cols = self.cols();
        let mut keys = self.aor_keys(&contact.aor);
        keys.push(Condition::eq(
            cols.instance.as_str(),
            DbValue::Str(instance.to_string()),
        ));
        keys.push(Condition::eq(
            cols.reg_id.as_str(),
            DbValue::Int(contact.reg_id as i64),
        ));
        keys
    }

    /// Keys identifying the row of `contact` for updates
    pub fn update_keys(&self, contact: &Contact) -> Result<Vec<Condition>> {
        if self.config.ops_by_ruid {
            return self.ruid_keys(contact);
        }
        match contact.instance.as_deref() {
            Some(instance) if !instance.is_empty() => Ok(self.instance_keys(contact, instance)),
            _ => Ok(self.address_keys(contact)),
        }
    }

    /// Keys identifying the row of `contact` for deletes
    pub fn delete_keys(&self, contact: &Contact) -> Result<Vec<Condition>> {
        if self.config.ops_by_ruid {
            return self.ruid_keys(contact);
        }
        Ok(self.address_keys(contact))
    }

    /// Full column/value list for `contact`
    pub fn row_values(&self, contact: &Contact) -> Vec<(String, DbValue)> {
        let cols = self.cols();
        let mut values = Vec::with_capacity(18);
        if self.config.use_domain {
            let (user, domain) = split_aor(&contact.aor);
            values.push(Self::col(&cols.user, DbValue::Str(user.to_string())));
            values.push(Self::col(&cols.domain, DbValue::Str(domain.to_string())));
        } else {
            values.push(Self::col(&cols.user, DbValue::Str(contact.aor.clone())));
        }
        values.push(Self::col(&cols.contact, DbValue::Str(contact.uri.clone())));
        values.push(Self::col(&cols.expires, DbValue::DateTime(contact.expires)));
        values.push(Self::col(&cols.q, DbValue::Double(contact.q as f64)));
        values.push(Self::col(&cols.callid, DbValue::Str(contact.callid.clone())));
        values.push(Self::col(&cols.cseq, DbValue::Int(contact.cseq as i64)));
        values.push(Self::col(&cols.flags, DbValue::Bitmap(contact.flags)));
        values.push(Self::col(&cols.cflags, DbValue::Bitmap(contact.cflags)));
        values.push(Self::col(&cols.user_agent, DbValue::Str(contact.user_agent.clone())));
        values.push(Self::col(&cols.received, DbValue::opt_str(contact.received.as_deref())));
        values.push(Self::col(&cols.path, DbValue::opt_str(contact.path.as_deref())));
        let socket = contact
            .socket
            .as_ref()
            .map_or(DbValue::Null, |s| DbValue::Str(s.sock_str()));
        values.push(Self::col(&cols.socket, socket));
        let methods = if contact.methods == ALL_METHODS {
            DbValue::Null
        } else {
            DbValue::Bitmap(contact.methods)
        };
        values.push(Self::col(&cols.methods, methods));
        values.push(Self::col(&cols.last_modified, DbValue::DateTime(contact.last_modified)));
        values.push(Self::col(&cols.ruid, DbValue::Str(contact.ruid.clone())));
        values.push(Self::col(&cols.instance, DbValue::opt_str(contact.instance.as_deref())));
        values.push(Self::col(&cols.reg_id, DbValue::Int(contact.reg_id as i64)));
        values
    }

    pub async fn insert(&self, contact: &Contact) -> Result<()> {
        if contact.ruid.is_empty() {
            return Err(RegistrarError::InvalidContact(format!(
                "refusing to store contact {} without ruid",
                contact.uri
            )));
        }
        self.store.insert(self.table, &self.row_values(contact)).await?;
        debug!(table = self.table, aor = %contact.aor, ruid = %contact.ruid, "contact row inserted");
        Ok(())
    }

    pub async fn update(&self, contact: &Contact) -> Result<()> {
        if self.config.update_as_insert {
            return self.upsert(contact).await;
        }
        let keys = self.update_keys(contact)?;
        let changed = self
            .store
            .update(self.table, &keys, &self.row_values(contact))
            .await?;
        if changed == 0 {
            debug!(table = self.table, aor = %contact.aor, ruid = %contact.ruid, "update matched no row");
        }
        Ok(())
    }

    /// Insert or replace the row with the contact's ruid
    pub async fn upsert(&self, contact: &Contact) -> Result<()> {
        if contact.ruid.is_empty() {
            return Err(RegistrarError::InvalidContact(format!(
                "refusing to upsert contact {} without ruid",
                contact.uri
            )));
        }
        self.store
            .insert_update(
                self.table,
                &self.row_values(contact),
                &[self.cols().ruid.clone()],
            )
            .await
    }

    pub async fn delete(&self, contact: &Contact) -> Result<()> {
        let keys = self.delete_keys(contact)?;
        self.store.delete(self.table, &keys).await?;
        debug!(table = self.table, aor = %contact.aor, ruid = %contact.ruid, "contact row deleted");
        Ok(())
    }

    /// Remove every row of `aor`
    pub async fn delete_aor(&self, aor: &str) -> Result<u64> {
        self.store.delete(self.table, &self.aor_keys(aor)).await
    }

    /// Remove rows expired at `now`; permanent rows are kept
    pub async fn delete_expired(&self, now: i64) -> Result<u64> {
        let expires = self.cols().expires.as_str();
        let keys = [
            Condition::new(expires, CmpOp::Lt, DbValue::DateTime(now + 1)),
            Condition::new(expires, CmpOp::Ne, DbValue::DateTime(0)),
        ];
        self.store.delete(self.table, &keys).await
    }

    /// Columns read for a contact, in [`Self::decode`] order
    fn contact_columns(&self) -> Vec<String> {
        let cols = self.cols();
        vec![
            cols.contact.clone(),
            cols.expires.clone(),
            cols.q.clone(),
            cols.callid.clone(),
            cols.cseq.clone(),
            cols.flags.clone(),
            cols.cflags.clone(),
            cols.user_agent.clone(),
            cols.received.clone(),
            cols.path.clone(),
            cols.socket.clone(),
            cols.methods.clone(),
            cols.last_modified.clone(),
            cols.ruid.clone(),
            cols.instance.clone(),
            cols.reg_id.clone(),
        ]
    }

    /// Contact columns followed by user and, with `use_domain`, domain
    fn full_columns(&self) -> Vec<String> {
        let mut columns = self.contact_columns();
        columns.push(self.cols().user.clone());
        if self.config.use_domain {
            columns.push(self.cols().domain.clone());
        }
        columns
    }

    fn order_column(&self) -> String {
        match self.config.contact_order {
            crate::config::ContactOrder::QValue => self.cols().q.clone(),
            crate::config::ContactOrder::LastModifiedDesc => self.cols().last_modified.clone(),
        }
    }

    /// Decode the contact columns of a row
    pub fn decode(&self, row: &[DbValue]) -> std::result::Result<(String, ContactInfo), String> {
        if row.len() < 16 {
            return Err(format!("short row with {} columns", row.len()));
        }
        let uri = match row[0].as_str() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => return Err("empty contact".to_string()),
        };
        let expires = row[1].as_i64().ok_or("null expires")?;
        let q = row[2].as_f64().ok_or("null q")? as f32;
        let callid = match row[3].as_str() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => return Err(format!("empty call-id for contact {}", uri)),
        };
        let cseq = row[4].as_i64().ok_or("null cseq")?;
        let flags = row[5].as_bitmap().ok_or("null flags")?;
        let cflags = row[6].as_bitmap().ok_or("null cflags")?;

        let socket = match row[10].as_str().filter(|s| !s.is_empty()) {
            None => None,
            Some(sock) => {
                let resolved = self.resolver.and_then(|r| r.resolve(sock));
                if resolved.is_none() {
                    debug!(socket = sock, contact = %uri, "non-local socket, ignoring");
                }
                resolved
            }
        };

        let ruid = match row[13].as_str() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => return Err(format!("no ruid for contact {}", uri)),
        };

        let info = ContactInfo {
            uri: Some(uri.clone()),
            expires,
            q,
            callid: Some(callid),
            cseq: cseq as u32,
            user_agent: row[7].as_str().unwrap_or_default().to_string(),
            received: row[8].as_str().filter(|s| !s.is_empty()).map(str::to_string),
            path: row[9].as_str().filter(|s| !s.is_empty()).map(str::to_string),
            socket,
            methods: if row[11].is_null() {
                ALL_METHODS
            } else {
                row[11].as_bitmap().unwrap_or(ALL_METHODS)
            },
            flags,
            cflags,
            ruid: Some(ruid),
            instance: row[14].as_str().filter(|s| !s.is_empty()).map(str::to_string),
            reg_id: row[15].as_i64().unwrap_or(0) as u32,
            last_modified: row[12].as_i64().unwrap_or(0),
        };
        Ok((uri, info))
    }

    /// Decode a row selected with the full column list
    pub fn decode_full(&self, row: &DbRow) -> std::result::Result<LoadedContact, String> {
        let (uri, info) = self.decode(row)?;
        let user = row
            .get(16)
            .and_then(DbValue::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| format!("empty username for contact {}", uri))?;
        let aor = if self.config.use_domain {
            let domain = row
                .get(17)
                .and_then(DbValue::as_str)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| format!("empty domain for user {}", user))?;
            format!("{}@{}", user, domain)
        } else {
            user.to_string()
        };
        Ok(LoadedContact { aor, uri, info })
    }

    /// Contacts of `aor` in the configured order; bad rows are skipped
    pub async fn load_aor(&self, aor: &str) -> Result<Vec<(String, ContactInfo)>> {
        let spec = QuerySpec::new(self.contact_columns())
            .filter(self.aor_keys(aor))
            .order_by(self.order_column());
        let rows = self.store.query(self.table, &spec).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.decode(row) {
                Ok(entry) => out.push(entry),
                Err(reason) => warn!(table = self.table, aor, %reason, "skipping bad contact row"),
            }
        }
        Ok(out)
    }

    /// The row carrying `ruid`, if any
    pub async fn load_by_ruid(&self, ruid: &str) -> Result<Option<LoadedContact>> {
        let spec = QuerySpec::new(self.full_columns()).filter(vec![Condition::eq(
            self.cols().ruid.as_str(),
            DbValue::Str(ruid.to_string()),
        )]);
        let rows = self.store.query(self.table, &spec).await?;
        match rows.first() {
            None => Ok(None),
            Some(row) => self
                .decode_full(row)
                .map(Some)
                .map_err(RegistrarError::InvalidContact),
        }
    }

    /// One page of all rows ordered by ruid
    pub async fn load_page(&self, offset: usize, limit: usize) -> Result<Vec<DbRow>> {
        let spec = QuerySpec::new(self.full_columns())
            .order_by(self.cols().ruid.clone())
            .page(offset, limit);
        self.store.query(self.table, &spec).await
    }

    /// Expiry plus user (and domain) of every row
    async fn aor_expiry_rows(&self) -> Result<Vec<DbRow>> {
        let mut columns = vec![self.cols().expires.clone(), self.cols().user.clone()];
        if self.config.use_domain {
            columns.push(self.cols().domain.clone());
        }
        self.store.query(self.table, &QuerySpec::new(columns)).await
    }

    fn is_active(row: &DbRow, now: i64) -> bool {
        matches!(row.first().and_then(DbValue::as_i64), Some(e) if e == 0 || e > now)
    }

    /// Unexpired rows at `now`
    pub async fn count_active_contacts(&self, now: i64) -> Result<usize> {
        let rows = self.aor_expiry_rows().await?;
        Ok(rows.iter().filter(|r| Self::is_active(r, now)).count())
    }

    /// Distinct AORs with an unexpired row at `now`
    pub async fn count_active_users(&self, now: i64) -> Result<usize> {
        let rows = self.aor_expiry_rows().await?;
        let users: HashSet<String> = rows
            .iter()
            .filter(|r| Self::is_active(r, now))
            .map(|row| {
                row[1..]
                    .iter()
                    .map(|v| v.as_str().unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join("@")
            })
            .collect();
        Ok(users.len())
    }

    /// Rows expired at `now`
    pub async fn count_expired(&self, now: i64) -> Result<usize> {
        let rows = self.aor_expiry_rows().await?;
        Ok(rows
            .iter()
            .filter(|r| !r[0].is_null() && !Self::is_active(r, now))
            .count())
    }
}
