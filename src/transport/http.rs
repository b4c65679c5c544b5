use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use super::{ReportSink, SinkReachability, SinkStatus};
use crate::ReportBatch;

const UPDATE_PATH: &str = "/parking-events/ml-update";

/// Backend sink: `POST {base}/parking-events/ml-update` with a JSON body.
pub struct HttpSink {
    base_url: String,
    agent: ureq::Agent,
    probe_agent: ureq::Agent,
}

impl HttpSink {
    pub fn new(base_url: &str, timeout: Duration, probe_timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        url::Url::parse(&base_url).with_context(|| format!("invalid backend url {}", base_url))?;
        Ok(Self {
            base_url,
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            probe_agent: ureq::AgentBuilder::new().timeout(probe_timeout).build(),
        })
    }

    fn update_url(&self) -> String {
        format!("{}{}", self.base_url, UPDATE_PATH)
    }
}

impl ReportSink for HttpSink {
    fn endpoint(&self) -> String {
        self.update_url()
    }

    fn deliver(&self, batch: &ReportBatch) -> Result<()> {
        let url = self.update_url();
        match self.agent.post(&url).send_json(batch) {
            Ok(response) if matches!(response.status(), 200 | 201) => Ok(()),
            Ok(response) => Err(anyhow!(
                "backend answered HTTP {} for lot {}",
                response.status(),
                batch.lot_id
            )),
            Err(ureq::Error::Status(code, _)) => Err(anyhow!(
                "backend answered HTTP {} for lot {}",
                code,
                batch.lot_id
            )),
            Err(err) => Err(err).with_context(|| format!("post detections to {}", url)),
        }
    }

    fn probe(&self) -> SinkReachability {
        match self.probe_agent.head(&self.base_url).call() {
            Ok(_) => SinkReachability::new(SinkStatus::Connected, &self.base_url),
            Err(ureq::Error::Status(code, _)) if code < 500 => {
                SinkReachability::new(SinkStatus::Connected, &self.base_url)
            }
            Err(ureq::Error::Status(code, _)) => {
                SinkReachability::new(SinkStatus::Error, &self.base_url)
                    .with_message(format!("HTTP {}", code))
            }
            Err(err) => SinkReachability::new(SinkStatus::Unreachable, &self.base_url)
                .with_message(err.to_string()),
        }
    }
}
