//! JSON-lines protocol: one request object per line in, one response per line out.
//!
//! Requests are tagged by `op`:
//!
//! ```text
//! {"op":"create_booking","studioId":"01J...","clientId":"01J...","start":1751536800000,"end":1751544000000}
//! {"ok":true,"data":{"id":"01J...","status":"pending","totalPrice":100.0,...}}
//! {"op":"cancel_booking","id":"01J..."}
//! {"ok":false,"error":"cannot cancel a cancelled booking","code":400}
//! ```
//!
//! After `listen`, events for that studio are pushed between responses as
//! `{"notify":{"studioId":"01J...","event":{...}}}`.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::engine::{BookingFilter, BookingPatch, Engine, EngineError, NewBooking, StudioPatch};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability;

const NOTIFY_BUFFER: usize = 256;

fn default_opening_hour() -> u8 {
    9
}

fn default_closing_hour() -> u8 {
    22
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Request {
    CreateStudio {
        id: Option<Ulid>,
        name: String,
        hourly_rate: f64,
        #[serde(default = "default_opening_hour")]
        opening_hour: u8,
        #[serde(default = "default_closing_hour")]
        closing_hour: u8,
        #[serde(default)]
        utc_offset_secs: i32,
    },
    UpdateStudio {
        id: Ulid,
        #[serde(flatten)]
        patch: StudioPatch,
    },
    DeleteStudio {
        id: Ulid,
    },
    GetStudio {
        id: Ulid,
    },
    ListStudios,
    CreateBooking {
        id: Option<Ulid>,
        studio_id: Ulid,
        client_id: Ulid,
        engineer_id: Option<Ulid>,
        start: Ms,
        end: Ms,
        notes: Option<String>,
        #[serde(default)]
        equipment_ids: Vec<Ulid>,
    },
    UpdateBooking {
        id: Ulid,
        #[serde(flatten)]
        patch: BookingPatch,
    },
    CancelBooking {
        id: Ulid,
        reason: Option<String>,
    },
    MarkPaid {
        id: Ulid,
    },
    GetBooking {
        id: Ulid,
    },
    ListBookings {
        #[serde(flatten)]
        filter: BookingFilter,
    },
    Calendar {
        from: Ms,
        to: Ms,
    },
    Availability {
        studio_id: Ulid,
        date: NaiveDate,
    },
    HasConflict {
        studio_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    },
    Quote {
        studio_id: Ulid,
        start: Ms,
        end: Ms,
    },
    Listen {
        studio_id: Ulid,
    },
    /// Without a studio id, drops every subscription of the connection.
    Unlisten {
        studio_id: Option<Ulid>,
    },
}

fn ok(data: Value) -> Value {
    json!({ "ok": true, "data": data })
}

fn err(message: String, code: u16) -> Value {
    json!({ "ok": false, "error": message, "code": code })
}

/// Per-connection state: the engine plus live LISTEN forwarders.
struct Session {
    engine: Arc<Engine>,
    listeners: HashMap<Ulid, JoinHandle<()>>,
    notify_tx: mpsc::Sender<Value>,
}

impl Session {
    async fn handle_line(&mut self, line: &str) -> Value {
        let req: Request = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                observability::record_unparsed_request();
                return err(format!("bad request: {e}"), 400);
            }
        };

        let op = observability::op_label(&req);
        let start = Instant::now();
        let result = self.execute(req).await;
        observability::record_request(op, result.is_ok(), start.elapsed());

        match result {
            Ok(data) => ok(data),
            Err(e) => {
                tracing::debug!("{op} failed: {e}");
                err(e.to_string(), e.code())
            }
        }
    }

    async fn execute(&mut self, req: Request) -> Result<Value, EngineError> {
        let engine = &self.engine;
        match req {
            Request::CreateStudio {
                id,
                name,
                hourly_rate,
                opening_hour,
                closing_hour,
                utc_offset_secs,
            } => {
                let studio = engine
                    .create_studio(Studio {
                        id: id.unwrap_or_else(Ulid::new),
                        name,
                        hourly_rate,
                        opening_hour,
                        closing_hour,
                        utc_offset_secs,
                    })
                    .await?;
                Ok(json!(studio))
            }
            Request::UpdateStudio { id, patch } => Ok(json!(engine.update_studio(id, patch).await?)),
            Request::DeleteStudio { id } => {
                engine.delete_studio(id).await?;
                if let Some(handle) = self.listeners.remove(&id) {
                    handle.abort();
                }
                Ok(json!({ "deleted": id }))
            }
            Request::GetStudio { id } => Ok(json!(engine.get_studio(id).await?)),
            Request::ListStudios => Ok(json!(engine.list_studios().await)),
            Request::CreateBooking {
                id,
                studio_id,
                client_id,
                engineer_id,
                start,
                end,
                notes,
                equipment_ids,
            } => {
                let booking = engine
                    .create_booking(NewBooking {
                        id: id.unwrap_or_else(Ulid::new),
                        studio_id,
                        client_id,
                        engineer_id,
                        start,
                        end,
                        notes,
                        equipment_ids,
                    })
                    .await?;
                Ok(json!(booking))
            }
            Request::UpdateBooking { id, patch } => Ok(json!(engine.update_booking(id, patch).await?)),
            Request::CancelBooking { id, reason } => {
                Ok(json!(engine.cancel_booking(id, reason).await?))
            }
            Request::MarkPaid { id } => Ok(json!(engine.mark_paid(id).await?)),
            Request::GetBooking { id } => Ok(json!(engine.get_booking(id).await?)),
            Request::ListBookings { filter } => Ok(json!(engine.list_bookings(&filter).await)),
            Request::Calendar { from, to } => Ok(json!(engine.calendar_bookings(from, to).await?)),
            Request::Availability { studio_id, date } => {
                Ok(json!(engine.check_availability(studio_id, date).await?))
            }
            Request::HasConflict {
                studio_id,
                start,
                end,
                exclude,
            } => {
                let conflict = engine.has_conflict(studio_id, start, end, exclude).await?;
                Ok(json!({ "conflict": conflict }))
            }
            Request::Quote { studio_id, start, end } => {
                let price = engine.quote(studio_id, start, end).await?;
                Ok(json!({ "price": price }))
            }
            Request::Listen { studio_id } => {
                engine.get_studio(studio_id).await?;
                self.listen(studio_id);
                Ok(json!({ "listening": studio_id }))
            }
            Request::Unlisten { studio_id } => {
                let dropped = match studio_id {
                    Some(sid) => self.listeners.remove(&sid).into_iter().collect::<Vec<_>>(),
                    None => self.listeners.drain().map(|(_, h)| h).collect(),
                };
                let count = dropped.len();
                for handle in dropped {
                    handle.abort();
                }
                Ok(json!({ "unlistened": count }))
            }
        }
    }

    /// Forward a studio's broadcast into this connection's outbound queue.
    fn listen(&mut self, studio_id: Ulid) {
        let mut rx = self.engine.notify.subscribe(studio_id);
        tracing::debug!(
            "listening on studio {studio_id} ({} listeners)",
            self.engine.notify.listener_count(&studio_id)
        );
        let tx = self.notify_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let msg = json!({ "notify": { "studioId": studio_id, "event": event } });
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("listener on studio {studio_id} dropped {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.listeners.insert(studio_id, handle) {
            previous.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for (_, handle) in self.listeners.drain() {
            handle.abort();
        }
    }
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (notify_tx, mut notify_rx) = mpsc::channel(NOTIFY_BUFFER);
    let mut session = Session {
        engine,
        listeners: HashMap::new(),
        notify_tx,
    };

    loop {
        tokio::select! {
            line = framed.next() => {
                let reply = match line {
                    None => break,
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => session.handle_line(&line).await,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        err(format!("request line exceeds {MAX_LINE_LEN} bytes"), 400)
                    }
                    Some(Err(LinesCodecError::Io(e))) => return Err(e),
                };
                framed.send(reply.to_string()).await.map_err(codec_err)?;
            }
            Some(msg) = notify_rx.recv() => {
                framed.send(msg.to_string()).await.map_err(codec_err)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_create_booking() {
        let sid = Ulid::new();
        let cid = Ulid::new();
        let line = format!(
            r#"{{"op":"create_booking","studioId":"{sid}","clientId":"{cid}","start":1000,"end":2000,"notes":"vocals"}}"#
        );
        let req: Request = serde_json::from_str(&line).unwrap();
        match req {
            Request::CreateBooking {
                id,
                studio_id,
                client_id,
                start,
                end,
                notes,
                equipment_ids,
                ..
            } => {
                assert!(id.is_none());
                assert_eq!(studio_id, sid);
                assert_eq!(client_id, cid);
                assert_eq!((start, end), (1000, 2000));
                assert_eq!(notes.as_deref(), Some("vocals"));
                assert!(equipment_ids.is_empty());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parse_create_studio_defaults_hours() {
        let req: Request =
            serde_json::from_str(r#"{"op":"create_studio","name":"B","hourlyRate":60}"#).unwrap();
        match req {
            Request::CreateStudio {
                opening_hour,
                closing_hour,
                utc_offset_secs,
                hourly_rate,
                ..
            } => {
                assert_eq!((opening_hour, closing_hour, utc_offset_secs), (9, 22, 0));
                assert_eq!(hourly_rate, 60.0);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parse_update_booking_patch() {
        let id = Ulid::new();
        let line = format!(r#"{{"op":"update_booking","id":"{id}","status":"confirmed","end":5000}}"#);
        let req: Request = serde_json::from_str(&line).unwrap();
        match req {
            Request::UpdateBooking { id: got, patch } => {
                assert_eq!(got, id);
                assert_eq!(patch.status, Some(BookingStatus::Confirmed));
                assert_eq!(patch.end, Some(5000));
                assert!(patch.start.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parse_list_bookings_filter() {
        let req: Request =
            serde_json::from_str(r#"{"op":"list_bookings","status":"pending"}"#).unwrap();
        match req {
            Request::ListBookings { filter } => {
                assert_eq!(filter.status, Some(BookingStatus::Pending));
                assert!(filter.client_id.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parse_unit_and_optional_ops() {
        assert!(matches!(
            serde_json::from_str::<Request>(r#"{"op":"list_studios"}"#).unwrap(),
            Request::ListStudios
        ));
        assert!(matches!(
            serde_json::from_str::<Request>(r#"{"op":"unlisten"}"#).unwrap(),
            Request::Unlisten { studio_id: None }
        ));
        let req: Request =
            serde_json::from_str(r#"{"op":"availability","studioId":"01ARZ3NDEKTSV4RRFFQ69G5FAV","date":"2025-07-03"}"#)
                .unwrap();
        assert!(matches!(req, Request::Availability { .. }));
    }

    #[test]
    fn unknown_op_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"op":"drop_table"}"#).is_err());
    }

    #[test]
    fn error_envelope_shape() {
        let v = err("not found".into(), 404);
        assert_eq!(v["ok"], false);
        assert_eq!(v["code"], 404);
        assert_eq!(ok(json!(1))["data"], 1);
    }
}
