use chrono::Utc;
use huddle_common::protocol::ServerEvent;
use huddle_common::types::{Identity, OperationRequest, PresenceData};
use tracing::{debug, info};

use super::RelayEngine;
use crate::collab::locks::LockOutcome;
use crate::collab::RoomState;
use crate::error::{CollabError, ErrorCode};
use crate::hub::{ConnectionId, GroupKey};
use crate::metrics;
use crate::presence::{GroupPresence, Member, SharedPresence};

impl RelayEngine {
    /// Join (creating on first use) a collaborative room and send the
    /// joiner a full state snapshot.
    pub(super) async fn join_room(
        &self,
        connection_id: ConnectionId,
        room_id: String,
        identity: Identity,
    ) -> Result<(), CollabError> {
        if room_id.trim().is_empty() {
            return Err(CollabError::Validation("roomId must not be empty".to_string()));
        }
        if identity.id.trim().is_empty() {
            return Err(CollabError::Validation("identityId must not be empty".to_string()));
        }
        self.hub.bind_identity(connection_id, identity.clone()).await;
        let group = self.presence.open_room(&room_id).await;
        let room = self.rooms.open_room(&room_id).await;
        let key = GroupKey::Room(room_id.clone());

        let mut participants = group.lock().await;
        let is_new = participants.join(&identity, connection_id);
        self.hub.join_group(connection_id, key.clone()).await;

        let state = room.lock().await;
        self.hub
            .emit_to(
                connection_id,
                ServerEvent::CollaborativeStateSync {
                    room_id: room_id.clone(),
                    shared_document: state.document().clone(),
                    operation_history: state.history(self.settings.state_sync_history),
                    participants: participants.participants(),
                    edit_locks: state.locks().snapshot(),
                },
            )
            .await;

        if let Some(member) = participants.member(&identity.id).filter(|_| is_new) {
            self.hub
                .emit_to_group_except(
                    &key,
                    connection_id,
                    ServerEvent::ParticipantJoined {
                        room_id: room_id.clone(),
                        participant: member.participant(),
                    },
                )
                .await;
        }
        self.hub
            .emit_to_group(
                &key,
                ServerEvent::ParticipantsUpdated {
                    room_id: room_id.clone(),
                    participants: participants.participants(),
                },
            )
            .await;

        info!(
            room_id = %room_id,
            identity_id = %identity.id,
            participants = participants.len(),
            last_seq = state.last_seq(),
            "joined collaborative room"
        );
        Ok(())
    }

    /// Leave a room, releasing every lock the identity holds there.
    pub(super) async fn leave_room(
        &self,
        connection_id: ConnectionId,
        room_id: String,
        identity_id: String,
    ) -> Result<(), CollabError> {
        let room = self.rooms.room(&room_id).await?;
        let group = self.room_presence(&room_id).await?;
        let key = GroupKey::Room(room_id.clone());

        let mut participants = group.lock().await;
        let departed = participants.leave(&identity_id);
        self.hub.leave_group(connection_id, &key).await;

        let mut state = room.lock().await;
        self.release_locks_held_by(&key, &room_id, &mut state, &identity_id).await;
        if let Some(member) = departed {
            self.announce_departures(&key, &room_id, vec![member], &participants).await;
            info!(room_id = %room_id, identity_id = %identity_id, "left collaborative room");
        }
        Ok(())
    }

    /// Sequence an operation and broadcast it with the resulting document to
    /// every participant, the author included.
    pub(super) async fn apply_operation(
        &self,
        connection_id: ConnectionId,
        room_id: String,
        mut request: OperationRequest,
    ) -> Result<(), CollabError> {
        let room = self.rooms.room(&room_id).await?;
        if request.identity_id.is_none() {
            request.identity_id = self.hub.identity(connection_id).await.map(|identity| identity.id);
        }
        let kind = request.kind.name();

        let mut state = room.lock().await;
        let operation = match state.apply(request) {
            Ok(operation) => operation,
            Err(error) => {
                metrics::increment_operations_rejected();
                debug!(room_id = %room_id, kind, error = %error, "operation rejected");
                return Err(error);
            }
        };
        metrics::increment_operations_applied();

        let seq = operation.seq;
        let delivered = self
            .hub
            .emit_to_group(
                &GroupKey::Room(room_id.clone()),
                ServerEvent::OperationApplied {
                    room_id: room_id.clone(),
                    operation,
                    shared_document: state.document().clone(),
                },
            )
            .await;
        debug!(room_id = %room_id, kind, seq, delivered, "operation broadcast");
        Ok(())
    }

    /// Try to take the edit lock on `field`. The outcome always goes back to
    /// the requester as `edit_lock_response`; a missing room or a requester
    /// that has not joined is reported there too.
    pub(super) async fn request_edit_lock(
        &self,
        connection_id: ConnectionId,
        room_id: String,
        field: String,
        identity_id: String,
    ) -> Result<(), CollabError> {
        if field.is_empty() {
            return Err(CollabError::Validation("fieldKey must not be empty".to_string()));
        }
        let Ok(room) = self.rooms.room(&room_id).await else {
            self.hub
                .emit_to(
                    connection_id,
                    ServerEvent::EditLockResponse {
                        room_id,
                        success: false,
                        field,
                        current_holder: None,
                        current_holder_id: None,
                        error: Some(ErrorCode::RoomNotFound.as_str().to_string()),
                    },
                )
                .await;
            return Ok(());
        };

        // Locks are only granted to participants bound to this connection, so
        // the connection's teardown always frees them.
        let group = self.room_presence(&room_id).await?;
        let participants = group.lock().await;
        let display_name = match participants.member(&identity_id) {
            Some(member) if member.connection_id == connection_id => member.display_name.clone(),
            _ => {
                debug!(room_id = %room_id, field = %field, identity_id = %identity_id, "edit lock from non-participant");
                self.hub
                    .emit_to(
                        connection_id,
                        ServerEvent::EditLockResponse {
                            room_id,
                            success: false,
                            field,
                            current_holder: None,
                            current_holder_id: None,
                            error: Some(ErrorCode::NotParticipant.as_str().to_string()),
                        },
                    )
                    .await;
                return Ok(());
            }
        };
        let identity = Identity::new(identity_id, display_name);
        let key = GroupKey::Room(room_id.clone());

        let mut state = room.lock().await;
        let outcome = state.locks_mut().acquire(&field, &identity);
        let response = match &outcome {
            LockOutcome::Conflict { holder } => {
                metrics::increment_lock_conflicts();
                debug!(
                    room_id = %room_id,
                    field = %field,
                    identity_id = %identity.id,
                    holder_id = %holder.identity_id,
                    "edit lock conflict"
                );
                ServerEvent::EditLockResponse {
                    room_id: room_id.clone(),
                    success: false,
                    field: field.clone(),
                    current_holder: Some(holder.display_name.clone()),
                    current_holder_id: Some(holder.identity_id.clone()),
                    error: None,
                }
            }
            LockOutcome::Acquired | LockOutcome::AlreadyHeld => ServerEvent::EditLockResponse {
                room_id: room_id.clone(),
                success: true,
                field: field.clone(),
                current_holder: None,
                current_holder_id: None,
                error: None,
            },
        };
        self.hub.emit_to(connection_id, response).await;

        if outcome == LockOutcome::Acquired {
            self.hub
                .emit_to_group_except(
                    &key,
                    connection_id,
                    ServerEvent::FieldLocked {
                        room_id: room_id.clone(),
                        field: field.clone(),
                        identity_id: identity.id.clone(),
                        display_name: identity.display_name.clone(),
                    },
                )
                .await;
            debug!(room_id = %room_id, field = %field, identity_id = %identity.id, "edit lock acquired");
        }
        Ok(())
    }

    /// Release is a no-op unless `identity_id` holds the lock.
    pub(super) async fn release_edit_lock(
        &self,
        connection_id: ConnectionId,
        room_id: String,
        field: String,
        identity_id: String,
    ) -> Result<(), CollabError> {
        let room = self.rooms.room(&room_id).await?;
        let mut state = room.lock().await;
        if !state.locks_mut().release(&field, &identity_id) {
            return Ok(());
        }

        self.hub
            .emit_to_group_except(
                &GroupKey::Room(room_id.clone()),
                connection_id,
                ServerEvent::FieldUnlocked { room_id: room_id.clone(), field: field.clone(), identity_id },
            )
            .await;
        debug!(room_id = %room_id, field = %field, "edit lock released");
        Ok(())
    }

    pub(super) async fn update_presence(
        &self,
        connection_id: ConnectionId,
        room_id: String,
        identity_id: String,
        presence_data: PresenceData,
    ) -> Result<(), CollabError> {
        let group = self.room_presence(&room_id).await?;
        let mut participants = group.lock().await;
        if !participants.update_presence(&identity_id, &presence_data) {
            debug!(room_id = %room_id, identity_id = %identity_id, "presence from non-participant ignored");
            return Ok(());
        }

        self.hub
            .emit_to_group_except(
                &GroupKey::Room(room_id.clone()),
                connection_id,
                ServerEvent::PresenceUpdated {
                    room_id,
                    identity_id,
                    presence_data,
                    timestamp: Utc::now(),
                },
            )
            .await;
        Ok(())
    }

    pub(super) async fn user_activity_change(
        &self,
        connection_id: ConnectionId,
        room_id: String,
        identity_id: String,
        is_active: bool,
    ) -> Result<(), CollabError> {
        let group = self.room_presence(&room_id).await?;
        let mut participants = group.lock().await;
        if !participants.set_active(&identity_id, is_active) {
            return Ok(());
        }

        self.hub
            .emit_to_group_except(
                &GroupKey::Room(room_id.clone()),
                connection_id,
                ServerEvent::UserActivityUpdated {
                    room_id,
                    identity_id,
                    is_active,
                    timestamp: Utc::now(),
                },
            )
            .await;
        Ok(())
    }

    /// Remove every participant bound to a closed connection from `room_id`,
    /// freeing their locks.
    pub(super) async fn drop_room_connection(&self, connection_id: ConnectionId, room_id: &str) {
        let (Ok(room), Ok(group)) =
            (self.rooms.room(room_id).await, self.room_presence(room_id).await)
        else {
            return;
        };
        let key = GroupKey::Room(room_id.to_string());

        let mut participants = group.lock().await;
        let departed = participants.remove_connection(connection_id);
        if departed.is_empty() {
            return;
        }

        let mut state = room.lock().await;
        for member in &departed {
            self.release_locks_held_by(&key, room_id, &mut state, &member.identity_id).await;
        }
        self.announce_departures(&key, room_id, departed, &participants).await;
    }

    async fn room_presence(&self, room_id: &str) -> Result<SharedPresence, CollabError> {
        self.presence
            .room(room_id)
            .await
            .ok_or_else(|| CollabError::RoomNotFound(room_id.to_string()))
    }

    async fn release_locks_held_by(
        &self,
        key: &GroupKey,
        room_id: &str,
        state: &mut RoomState,
        identity_id: &str,
    ) {
        for field in state.locks_mut().release_holder(identity_id) {
            self.hub
                .emit_to_group(
                    key,
                    ServerEvent::FieldUnlocked {
                        room_id: room_id.to_string(),
                        field,
                        identity_id: identity_id.to_string(),
                    },
                )
                .await;
        }
    }

    async fn announce_departures(
        &self,
        key: &GroupKey,
        room_id: &str,
        departed: Vec<Member>,
        remaining: &GroupPresence,
    ) {
        for member in departed {
            self.hub
                .emit_to_group(
                    key,
                    ServerEvent::ParticipantLeft {
                        room_id: room_id.to_string(),
                        identity_id: member.identity_id,
                        display_name: Some(member.display_name),
                    },
                )
                .await;
        }
        self.hub
            .emit_to_group(
                key,
                ServerEvent::ParticipantsUpdated {
                    room_id: room_id.to_string(),
                    participants: remaining.participants(),
                },
            )
            .await;
    }
}
