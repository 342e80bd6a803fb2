use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;
use vfmigrate_parser::strip_extension;

use crate::error::Result;

/// Court name assigned when a site code has no mapping.
pub const UNKNOWN_COURT: &str = "Unknown Court";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CourtRef {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteResolution {
    pub court_name: String,
    pub from_sentinel: bool,
}

/// A share-booking contact taken from the channel user list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
struct SiteRow {
    site_reference: String,
    site_name: String,
}

#[derive(Debug, Deserialize)]
struct ChannelRow {
    channel_name: String,
    channel_user: String,
    channel_user_email: String,
}

/// Lookups loaded once per run: site code to court name, court name to
/// court id, and archive to share-booking contacts.
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    sites: HashMap<String, String>,
    courts: HashMap<String, CourtRef>,
    contacts: HashMap<String, Vec<Contact>>,
}

impl ReferenceData {
    /// Loads the site and channel lists when given. The court directory is
    /// synthesised from the site names; callers with a database replace it
    /// through [`ReferenceData::with_courts`].
    pub fn from_paths(sites: Option<&Path>, channels: Option<&Path>) -> Result<Self> {
        let mut data = ReferenceData::default();
        if let Some(path) = sites {
            data.load_sites(File::open(path)?)?;
        }
        if let Some(path) = channels {
            data.load_channels(File::open(path)?)?;
        }
        data.synthesise_courts();
        Ok(data)
    }

    pub fn from_readers<S: Read, C: Read>(sites: S, channels: Option<C>) -> Result<Self> {
        let mut data = ReferenceData::default();
        data.load_sites(sites)?;
        if let Some(channels) = channels {
            data.load_channels(channels)?;
        }
        data.synthesise_courts();
        Ok(data)
    }

    pub fn with_site(mut self, code: &str, court_name: &str) -> Self {
        self.sites
            .insert(code.trim().to_ascii_uppercase(), court_name.trim().to_string());
        self.synthesise_courts();
        self
    }

    pub fn with_courts(mut self, courts: impl IntoIterator<Item = CourtRef>) -> Self {
        self.courts = courts
            .into_iter()
            .map(|court| (court_key(&court.name), court))
            .collect();
        self
    }

    pub fn with_contact(mut self, archive_name: &str, contact: Contact) -> Self {
        self.contacts
            .entry(contact_key(archive_name))
            .or_default()
            .push(contact);
        self
    }

    fn load_sites<R: Read>(&mut self, reader: R) -> Result<()> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        for row in csv_reader.deserialize::<SiteRow>() {
            let row = row?;
            if row.site_reference.is_empty() || row.site_name.is_empty() {
                continue;
            }
            self.sites
                .insert(row.site_reference.to_ascii_uppercase(), row.site_name);
        }
        Ok(())
    }

    fn load_channels<R: Read>(&mut self, reader: R) -> Result<()> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        for row in csv_reader.deserialize::<ChannelRow>() {
            let row = row?;
            if row.channel_name.is_empty() || row.channel_user_email.is_empty() {
                continue;
            }
            let (first_name, last_name) = split_channel_user(&row.channel_user);
            let contacts = self.contacts.entry(contact_key(&row.channel_name)).or_default();
            let contact = Contact {
                first_name,
                last_name,
                email: row.channel_user_email.to_lowercase(),
            };
            if !contacts.contains(&contact) {
                contacts.push(contact);
            }
        }
        Ok(())
    }

    fn synthesise_courts(&mut self) {
        let names = self
            .sites
            .values()
            .map(String::as_str)
            .chain(std::iter::once(UNKNOWN_COURT))
            .map(str::to_string)
            .collect::<Vec<_>>();
        for name in names {
            self.courts
                .entry(court_key(&name))
                .or_insert_with(|| CourtRef {
                    id: Uuid::new_v4(),
                    name,
                });
        }
    }

    /// Maps a parsed court code to a court name. Unmapped codes resolve to
    /// [`UNKNOWN_COURT`] and are logged.
    pub fn resolve_site(&self, court_reference: &str) -> SiteResolution {
        let code = court_reference.trim().to_ascii_uppercase();
        match self.sites.get(&code) {
            Some(name) => SiteResolution {
                court_name: name.clone(),
                from_sentinel: false,
            },
            None => {
                warn!(court_reference = %court_reference, "No site mapping for court reference; using Unknown Court");
                SiteResolution {
                    court_name: UNKNOWN_COURT.to_string(),
                    from_sentinel: true,
                }
            }
        }
    }

    pub fn court_by_name(&self, name: &str) -> Option<&CourtRef> {
        self.courts.get(&court_key(name))
    }

    pub fn contacts_for(&self, archive_name: &str) -> &[Contact] {
        self.contacts
            .get(&contact_key(archive_name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn courts(&self) -> impl Iterator<Item = &CourtRef> {
        self.courts.values()
    }
}

fn court_key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn contact_key(archive_name: &str) -> String {
    strip_extension(archive_name.trim()).to_lowercase()
}

fn split_channel_user(user: &str) -> (String, String) {
    match user.trim().split_once('.') {
        Some((first, last)) => (first.trim().to_string(), last.trim().to_string()),
        None => (user.trim().to_string(), String::new()),
    }
}
