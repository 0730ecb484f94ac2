// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The command channel to the forwarding agent.
//!
//! The agent holds a set of bindings, one per (resource, BGPVPN) pair. An
//! attach installs or replaces a binding and a detach removes it, so both
//! commands are idempotent. The [`Agent`] trait decouples the sync loop from
//! the transport so it can be tested without a running agent.

use crate::error::Error;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;
use vdb::{AssociationKind, Bgpvpn, VpnType};

/// Install or replace the binding of a resource to a BGPVPN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AttachCommand {
    pub resource_id: String,
    pub resource_type: AssociationKind,
    pub bgpvpn_id: Uuid,
    #[serde(rename = "type")]
    pub vpn_type: VpnType,
    pub route_targets: Vec<String>,
    pub import_targets: Vec<String>,
    pub export_targets: Vec<String>,
    pub route_distinguishers: Vec<String>,
    pub vni: Option<u32>,
    pub local_pref: Option<u64>,
}

impl AttachCommand {
    pub fn new(
        resource_type: AssociationKind,
        resource_id: impl Into<String>,
        bgpvpn: &Bgpvpn,
    ) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_type,
            bgpvpn_id: bgpvpn.id,
            vpn_type: bgpvpn.vpn_type,
            route_targets: bgpvpn.route_targets.clone(),
            import_targets: bgpvpn.import_targets.clone(),
            export_targets: bgpvpn.export_targets.clone(),
            route_distinguishers: bgpvpn.route_distinguishers.clone(),
            vni: bgpvpn.vni,
            local_pref: bgpvpn.local_pref,
        }
    }

    pub fn key(&self) -> BindingKey {
        BindingKey {
            resource_type: self.resource_type,
            resource_id: self.resource_id.clone(),
            bgpvpn_id: self.bgpvpn_id,
        }
    }
}

/// Remove the binding of a resource to a BGPVPN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DetachCommand {
    pub resource_id: String,
    pub resource_type: AssociationKind,
    pub bgpvpn_id: Uuid,
}

impl From<BindingKey> for DetachCommand {
    fn from(value: BindingKey) -> Self {
        Self {
            resource_id: value.resource_id,
            resource_type: value.resource_type,
            bgpvpn_id: value.bgpvpn_id,
        }
    }
}

/// Identifies one agent binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingKey {
    pub resource_type: AssociationKind,
    pub resource_id: String,
    pub bgpvpn_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Attach(AttachCommand),
    Detach(DetachCommand),
}

/// The agent operations the sync loop uses.
#[allow(async_fn_in_trait)]
pub trait Agent {
    async fn attach(&self, cmd: &AttachCommand) -> Result<(), Error>;

    async fn detach(&self, cmd: &DetachCommand) -> Result<(), Error>;

    /// Every binding currently installed on the agent.
    async fn list(&self) -> Result<Vec<AttachCommand>, Error>;
}

/// Characters escaped within a single URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// An agent reached over HTTP.
pub struct HttpAgent {
    client: reqwest::Client,
    base: String,
}

impl HttpAgent {
    pub fn new(base: &str, timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    /// The URL naming one binding. Each segment is percent encoded so
    /// resource ids cannot spill into the query or fragment.
    fn binding_url(&self, cmd: &DetachCommand) -> String {
        let segment = |s: &str| utf8_percent_encode(s, PATH_SEGMENT).to_string();
        format!(
            "{}/attachments/{}/{}/{}",
            self.base,
            segment(cmd.resource_type.as_str()),
            segment(&cmd.resource_id),
            cmd.bgpvpn_id,
        )
    }

    async fn check(
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, Error> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(Error::AgentStatus {
            status: status.as_u16(),
            body,
        })
    }
}

impl Agent for HttpAgent {
    async fn attach(&self, cmd: &AttachCommand) -> Result<(), Error> {
        let resp = self
            .client
            .post(format!("{}/attachments", self.base))
            .json(cmd)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn detach(&self, cmd: &DetachCommand) -> Result<(), Error> {
        let resp = self
            .client
            .delete(self.binding_url(cmd))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<AttachCommand>, Error> {
        let resp = self
            .client
            .get(format!("{}/attachments", self.base))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }
}

#[cfg(test)]
mod url_test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn detach(resource_id: &str, bgpvpn_id: Uuid) -> DetachCommand {
        DetachCommand {
            resource_id: resource_id.into(),
            resource_type: AssociationKind::Network,
            bgpvpn_id,
        }
    }

    #[test]
    fn binding_url_escapes_reserved_characters() {
        let agent =
            HttpAgent::new("http://agent:8080/", Duration::from_secs(1))
                .expect("build agent");
        let id = Uuid::new_v4();

        assert_eq!(
            agent.binding_url(&detach("net1", id)),
            format!("http://agent:8080/attachments/network/net1/{id}"),
        );
        assert_eq!(
            agent.binding_url(&detach("net#1", id)),
            format!("http://agent:8080/attachments/network/net%231/{id}"),
        );
        assert_eq!(
            agent.binding_url(&detach("a?b c%", id)),
            format!("http://agent:8080/attachments/network/a%3Fb%20c%25/{id}"),
        );

        let url = reqwest::Url::parse(&agent.binding_url(&detach("net#1", id)))
            .expect("parse url");
        assert_eq!(url.fragment(), None);
        assert_eq!(url.query(), None);
        assert_eq!(
            url.path_segments().expect("segments").collect::<Vec<_>>(),
            vec!["attachments", "network", "net%231", &id.to_string()],
        );
    }
}
