//! Scripted partner API used by unit tests across modules.

use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::client::{RawResponse, Transport, TransportError};

pub const BASE_URL: &str = "https://partner.test/v1";

#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, String),
    Timeout,
}

impl Reply {
    pub fn json(value: Value) -> Self {
        Reply::Status(200, value.to_string())
    }

    pub fn status(status: u16, body: &str) -> Self {
        Reply::Status(status, body.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

#[derive(Default)]
struct Script {
    routes: BTreeMap<String, Reply>,
    calls: Vec<Call>,
}

/// Replies by path (the URL minus [`BASE_URL`]); unknown paths get a 404.
#[derive(Clone, Default)]
pub struct FakePartner {
    script: Arc<Mutex<Script>>,
}

impl FakePartner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, path: &str, reply: Reply) {
        self.script.lock().unwrap().routes.insert(path.to_string(), reply);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn paths_called(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|c| c.url.trim_start_matches(BASE_URL).to_string())
            .collect()
    }

    /// Script a fleet: `locations` sites, each with `machines` machines that
    /// report `errors` errors apiece and expose two programs each.
    pub fn with_fleet(locations: usize, machines: usize, errors: usize) -> Self {
        let partner = FakePartner::new();
        let mut loc_items = Vec::new();
        for l in 0..locations {
            let loc_id = format!("loc_{l}");
            loc_items.push(json!({
                "id": loc_id,
                "name": format!("Campus {l} - Hall {l}"),
                "timezone": "America/New_York",
                "address": format!("{l} Main St"),
                "latitude": 40.0,
                "longitude": -74.0,
                "status": "ACTIVE",
            }));

            let mut machine_items = Vec::new();
            for m in 0..machines {
                let mac_id = format!("mac_{l}_{m}");
                machine_items.push(json!({
                    "id": mac_id,
                    "name": format!("Washer {m}"),
                    "controlId": format!("ctl-{l}-{m}"),
                    "serialNumber": format!("SN{l}{m}"),
                    "modelNumber": "SC20",
                    "machineType": { "name": "Front Load Washer", "isWasher": true },
                    "status": { "door": "CLOSED", "remainingSeconds": 0 },
                }));
                let error_items: Vec<Value> = (0..errors)
                    .map(|e| {
                        json!({
                            "id": format!("00000000-0000-4000-8000-{l:04}{m:04}{e:04}"),
                            "errorName": "DOOR_LOCK_FAILURE",
                            "errorType": "MECHANICAL",
                            "errorCode": 17,
                            "timestamp": "2024-05-01T10:00:00Z",
                        })
                    })
                    .collect();
                partner.reply(
                    &format!("/locations/{loc_id}/machines/{mac_id}/errors"),
                    Reply::json(json!({ "data": error_items })),
                );
                partner.reply(
                    &format!("/locations/{loc_id}/machines/{mac_id}/cycles"),
                    Reply::json(json!({ "data": [
                        { "id": format!("cyc_{l}_{m}_normal"), "name": "Normal", "type": "WASH", "sortOrder": 1,
                          "modifiers": [ { "id": format!("mod_{l}_{m}_extra"), "name": "Extra Rinse", "type": "RINSE" } ] },
                        { "id": format!("cyc_{l}_{m}_delicate"), "name": "Delicate", "type": "WASH", "sortOrder": 2 },
                    ]})),
                );
            }
            partner.reply(
                &format!("/locations/{loc_id}/machines"),
                Reply::json(json!({ "data": machine_items })),
            );
        }
        partner.reply("/locations", Reply::json(json!({ "data": loc_items })));
        partner
    }

    /// `/reports` is keyed by path only, so one reply carries a block for
    /// every location; the sync keeps the block it asked for.
    pub fn with_reports(self, locations: usize, machines: usize) -> Self {
        let blocks: Vec<Value> = (0..locations)
            .map(|l| {
                let entries: Vec<Value> = (0..machines)
                    .map(|m| {
                        json!({
                            "machineId": format!("mac_{l}_{m}"),
                            "vaultSize": 400,
                            "totalCoins": 120,
                            "totalCycles": 30,
                            "hotCycles": 10,
                            "warmCycles": 10,
                            "coldCycles": 10,
                            "cyclesByType": { "NORMAL": 25, "DELICATE": 5 },
                            "totalVended": 9000,
                            "coinVended": 4000,
                            "cardVended": 5000,
                            "firstReceivedAt": "2024-05-01T00:00:00Z",
                            "lastReceivedAt": "2024-05-01T23:00:00Z",
                        })
                    })
                    .collect();
                json!({ "locationId": format!("loc_{l}"), "machines": entries })
            })
            .collect();
        self.reply("/reports", Reply::json(json!({ "data": { "locations": blocks } })));
        self
    }
}

impl Transport for FakePartner {
    fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, &str)],
    ) -> Result<RawResponse, TransportError> {
        let mut script = self.script.lock().unwrap();
        script.calls.push(Call {
            url: url.to_string(),
            query: query.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        });
        let path = url.strip_prefix(BASE_URL).unwrap_or(url);
        match script.routes.get(path) {
            Some(Reply::Status(status, body)) => Ok(RawResponse {
                status: *status,
                body: body.clone(),
            }),
            Some(Reply::Timeout) => Err(TransportError::Timeout),
            None => Ok(RawResponse {
                status: 404,
                body: format!("no route for {path}"),
            }),
        }
    }
}
