// shared-core - bitdrift's common client/server libraries
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use parking_lot::Mutex;
use std::collections::VecDeque;
use tl_network::{Endpoint, Response, Transport, TransportError};
use tokio::sync::watch;

//
// RecordingTransport
//

/// Transport fake that records every attempted send and replies with scripted responses. Once
/// the script runs out every send succeeds with a 200.
pub struct RecordingTransport {
  responses: Mutex<VecDeque<Result<Response, TransportError>>>,
  sent: Mutex<Vec<(Endpoint, String)>>,
  sent_count_tx: watch::Sender<usize>,
}

impl Default for RecordingTransport {
  fn default() -> Self {
    Self {
      responses: Mutex::default(),
      sent: Mutex::default(),
      sent_count_tx: watch::channel(0).0,
    }
  }
}

impl RecordingTransport {
  pub fn push_status(&self, status: u16, body: &str) {
    self.responses.lock().push_back(Ok(Response {
      status,
      body: body.to_string(),
    }));
  }

  pub fn push_error(&self, error: TransportError) {
    self.responses.lock().push_back(Err(error));
  }

  pub fn sent(&self) -> Vec<(Endpoint, String)> {
    self.sent.lock().clone()
  }

  pub fn sent_queries(&self) -> Vec<String> {
    self.sent.lock().iter().map(|(_, q)| q.clone()).collect()
  }

  /// Waits until at least `count` sends have been attempted.
  pub async fn wait_for_sends(&self, count: usize) {
    let mut rx = self.sent_count_tx.subscribe();
    rx.wait_for(|sent| *sent >= count).await.unwrap();
  }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
  async fn send(&self, endpoint: Endpoint, query: &str) -> Result<Response, TransportError> {
    let count = {
      let mut sent = self.sent.lock();
      sent.push((endpoint, query.to_string()));
      sent.len()
    };
    self.sent_count_tx.send_replace(count);

    self.responses.lock().pop_front().unwrap_or_else(|| {
      Ok(Response {
        status: 200,
        body: r#"{"result":"Success"}"#.to_string(),
      })
    })
  }
}
