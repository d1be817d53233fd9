//! Durable per-trip messaging with typing and read receipts.
//!
//! Chat is open to exactly the trip's two participants and only while the
//! trip is matched but unfinished. Messages persist; typing indicators are
//! ephemeral and only ever reach the counterparty.

use common::api::error::{ApiError, ApiResult};
use common::api::events::WireEvent;
use common::api::models::{
    ChatMessagePayload, ChatMessagesReadPayload, ChatTypingPayload,
};
use common::constants;
use common::ids::{MessageId, TripId, UserId};
use common::time::TimestampMs;
use common::trip::TripRecord;
use store::db::{Db, DbTx};
use store::keys;
use store::kv::{KvStore, KvStoreExt};
use store::models::ChatMessageRow;
use tracing::instrument;

use crate::events::{EventSink, Room};

pub struct ChatService<K, D, S> {
    kv: K,
    db: D,
    sink: S,
}

impl<K: KvStore, D: Db, S: EventSink> Clone for ChatService<K, D, S> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
            db: self.db.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<K: KvStore, D: Db, S: EventSink> ChatService<K, D, S> {
    pub fn new(kv: K, db: D, sink: S) -> Self {
        Self { kv, db, sink }
    }

    /// Persist a message and deliver it to the counterparty and the trip
    /// room.
    #[instrument(skip(self, text))]
    pub async fn send(
        &self,
        sender: UserId,
        trip_id: TripId,
        text: &str,
    ) -> ApiResult<ChatMessagePayload> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ApiError::validation("message must not be empty"));
        }
        if text.chars().count() > constants::CHAT_MAX_CHARS {
            return Err(ApiError::validation(format!(
                "message exceeds {} characters",
                constants::CHAT_MAX_CHARS,
            )));
        }

        let record = self.chat_context(sender, trip_id).await?;
        let recipient = counterparty(&record, sender);
        let message = ChatMessageRow {
            id: MessageId::generate(),
            trip_id,
            from_user_id: sender,
            text: text.to_string(),
            sent_at: TimestampMs::now(),
            read_at: None,
        };

        let mut tx = self.db.begin().await.map_err(ApiError::from)?;
        tx.insert_chat_message(&message).await?;
        tx.commit().await?;

        let payload = ChatMessagePayload {
            message_id: message.id,
            trip_id,
            from_user_id: sender,
            text: message.text.clone(),
            sent_at: message.sent_at,
        };
        self.sink.emit(
            Room::User(recipient),
            WireEvent::ChatNewMessage(payload.clone()),
        );
        self.sink.emit(
            Room::Trip(trip_id),
            WireEvent::ChatNewMessage(payload.clone()),
        );
        Ok(payload)
    }

    /// Ephemeral typing indicator; never persisted.
    pub async fn typing(
        &self,
        sender: UserId,
        trip_id: TripId,
        typing: bool,
    ) -> ApiResult<()> {
        let record = self.chat_context(sender, trip_id).await?;
        let recipient = counterparty(&record, sender);
        self.sink.emit(
            Room::User(recipient),
            WireEvent::ChatTyping(ChatTypingPayload {
                trip_id,
                user_id: sender,
                typing,
            }),
        );
        Ok(())
    }

    /// Mark everything addressed to the caller as read and tell the
    /// counterparty.
    #[instrument(skip(self))]
    pub async fn mark_read(
        &self,
        reader: UserId,
        trip_id: TripId,
    ) -> ApiResult<u64> {
        let record = self.chat_context(reader, trip_id).await?;
        let counterparty = counterparty(&record, reader);
        let read_at = TimestampMs::now();

        let mut tx = self.db.begin().await.map_err(ApiError::from)?;
        let marked = tx.mark_chat_read(trip_id, reader, read_at).await?;
        tx.commit().await?;

        if marked > 0 {
            self.sink.emit(
                Room::User(counterparty),
                WireEvent::ChatMessagesRead(ChatMessagesReadPayload {
                    trip_id,
                    reader_id: reader,
                    read_at,
                }),
            );
        }
        Ok(marked)
    }

    /// Chat is gated on the live trip record: present, in a chat-friendly
    /// status, and the caller one of its two participants.
    async fn chat_context(
        &self,
        caller: UserId,
        trip_id: TripId,
    ) -> ApiResult<TripRecord> {
        let Some(record) = self
            .kv
            .get_json::<TripRecord>(&keys::trip(&trip_id))
            .await?
        else {
            return Err(ApiError::precondition(
                "chat is closed for this trip",
            ));
        };
        if !record.status.allows_chat() {
            return Err(ApiError::precondition(
                "chat is closed for this trip",
            ));
        }
        let is_participant = caller == record.passenger_id
            || record.driver_id == Some(caller);
        if !is_participant {
            return Err(ApiError::forbidden("not a participant of this trip"));
        }
        Ok(record)
    }
}

fn counterparty(record: &TripRecord, sender: UserId) -> UserId {
    if sender == record.passenger_id {
        // allows_chat() implies a matched trip, which has a driver.
        record.driver_id.unwrap_or(record.passenger_id)
    } else {
        record.passenger_id
    }
}
