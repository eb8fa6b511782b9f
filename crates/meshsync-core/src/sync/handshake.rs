//! Mutual challenge/response authentication
//!
//! Both sides prove possession of the signing key their identifier embeds by
//! signing a transcript that binds both challenges and both identifiers, so a
//! signature can be neither replayed into another session nor reflected back
//! at its author. Presented keys are then checked against the pins in the
//! [`PeerRegistry`]; nothing is written to the registry until the peer's
//! proof has verified.

use tracing::{debug, warn};

use crate::crypto::derive_session_key;
use crate::error::{SyncError, SyncResult};
use crate::identity::{verify_ed25519, Did, IdentityService};
use crate::peers::{ContactInfo, PeerRegistry, TrustDecision};
use crate::transport::{BearerKind, Connection};
use crate::types::PeerRecord;

use super::protocol::{Frame, Hello, Proof};

const HELLO_CONTEXT: &[u8] = b"meshsync-hello-v1";
const TRANSCRIPT_CONTEXT: &[u8] = b"meshsync-auth-v1";

/// Authenticated peer plus the key for the rest of the session.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub peer: PeerRecord,
    pub session_key: [u8; 32],
    pub first_contact: bool,
}

/// Local side of a handshake.
pub struct Handshake<'a> {
    pub identity: &'a dyn IdentityService,
    pub registry: &'a PeerRegistry,
    pub display_name: Option<&'a str>,
    pub transports: &'a [BearerKind],
}

impl Handshake<'_> {
    /// Run the initiator side: send our challenge first.
    pub async fn initiate(&self, conn: &mut Connection) -> SyncResult<HandshakeOutcome> {
        let challenge: [u8; 32] = rand::random();
        let hello = self.hello(challenge, None)?;
        send(conn, &Frame::Hello(hello)).await?;

        let theirs = match Frame::decode(&conn.recv().await?)? {
            Frame::Hello(hello) => hello,
            Frame::Reject { reason } => return Err(SyncError::Authentication(reason)),
            other => return Err(unexpected(other)),
        };

        let checked = self.check_hello(&theirs).and_then(|decision| {
            let counter = theirs.counter_signature.as_deref().ok_or_else(|| {
                SyncError::Authentication("Responder sent no counter-signature".into())
            })?;
            let transcript = transcript(
                b"responder",
                &challenge,
                &theirs.challenge,
                self.identity.peer_id(),
                &theirs.peer_id,
            );
            if !verify_ed25519(counter, &transcript, &theirs.signing_key) {
                return Err(SyncError::Authentication(format!(
                    "{} failed to sign our challenge",
                    theirs.peer_id.short()
                )));
            }
            Ok(decision)
        });
        let decision = reject_on_error(conn, checked).await?;

        let proof = transcript(
            b"initiator",
            &challenge,
            &theirs.challenge,
            self.identity.peer_id(),
            &theirs.peer_id,
        );
        send(
            conn,
            &Frame::Proof(Proof {
                counter_signature: self.identity.sign(&proof),
            }),
        )
        .await?;

        self.finish(theirs, decision, &challenge, true)
    }

    /// Run the responder side: answer a peer's challenge with our own.
    pub async fn respond(&self, conn: &mut Connection) -> SyncResult<HandshakeOutcome> {
        let theirs = match Frame::decode(&conn.recv().await?)? {
            Frame::Hello(hello) if hello.counter_signature.is_none() => hello,
            Frame::Reject { reason } => return Err(SyncError::Authentication(reason)),
            other => return Err(unexpected(other)),
        };
        reject_on_error(conn, self.check_hello(&theirs)).await?;

        let challenge: [u8; 32] = rand::random();
        let counter = self.identity.sign(&transcript(
            b"responder",
            &theirs.challenge,
            &challenge,
            &theirs.peer_id,
            self.identity.peer_id(),
        ));
        send(conn, &Frame::Hello(self.hello(challenge, Some(counter))?)).await?;

        let proof = match Frame::decode(&conn.recv().await?)? {
            Frame::Proof(proof) => proof,
            Frame::Reject { reason } => return Err(SyncError::Authentication(reason)),
            other => return Err(unexpected(other)),
        };
        let expected = transcript(
            b"initiator",
            &theirs.challenge,
            &challenge,
            &theirs.peer_id,
            self.identity.peer_id(),
        );
        let verified = if verify_ed25519(&proof.counter_signature, &expected, &theirs.signing_key) {
            // Pins may have changed while we waited for the proof
            self.registry
                .check_trust(&theirs.peer_id, &theirs.signing_key, &theirs.agreement_key)
        } else {
            Err(SyncError::Authentication(format!(
                "{} failed to sign our challenge",
                theirs.peer_id.short()
            )))
        };
        let decision = reject_on_error(conn, verified).await?;

        self.finish(theirs, decision, &challenge, false)
    }

    fn hello(&self, challenge: [u8; 32], counter_signature: Option<Vec<u8>>) -> SyncResult<Hello> {
        let mut hello = Hello {
            peer_id: self.identity.peer_id().clone(),
            display_name: self.display_name.map(str::to_string),
            signing_key: self.identity.signing_public_key(),
            agreement_key: self.identity.agreement_public_key(),
            challenge,
            transports: self.transports.to_vec(),
            counter_signature,
            signature: Vec::new(),
        };
        hello.signature = self.identity.sign(&hello_body(&hello)?);
        Ok(hello)
    }

    /// Self-signature, identifier binding and key pins of a peer's hello.
    fn check_hello(&self, hello: &Hello) -> SyncResult<TrustDecision> {
        if &hello.peer_id == self.identity.peer_id() {
            return Err(SyncError::Authentication("Peer presented our own identifier".into()));
        }
        if !verify_ed25519(&hello.signature, &hello_body(hello)?, &hello.signing_key) {
            return Err(SyncError::Authentication(format!(
                "Hello from {} carries an invalid signature",
                hello.peer_id.short()
            )));
        }
        self.registry
            .check_trust(&hello.peer_id, &hello.signing_key, &hello.agreement_key)
    }

    fn finish(
        &self,
        theirs: Hello,
        decision: TrustDecision,
        our_challenge: &[u8; 32],
        initiator: bool,
    ) -> SyncResult<HandshakeOutcome> {
        let shared = self.identity.agree(&theirs.agreement_key)?;
        let (init_challenge, resp_challenge) = if initiator {
            (our_challenge, &theirs.challenge)
        } else {
            (&theirs.challenge, our_challenge)
        };
        let session_key = derive_session_key(
            &shared,
            init_challenge,
            resp_challenge,
            self.identity.peer_id().as_str(),
            theirs.peer_id.as_str(),
        );

        let first_contact = decision == TrustDecision::FirstContact;
        let peer = self.registry.record_contact(ContactInfo {
            peer_id: theirs.peer_id,
            signing_key: theirs.signing_key,
            agreement_key: theirs.agreement_key,
            display_name: theirs.display_name,
            transports: theirs.transports,
        })?;
        debug!(peer = %peer.peer_id.short(), first_contact, "Handshake complete");

        Ok(HandshakeOutcome {
            peer,
            session_key,
            first_contact,
        })
    }
}

async fn send(conn: &Connection, frame: &Frame) -> SyncResult<()> {
    conn.send(frame.encode()?).await?;
    Ok(())
}

/// On authentication failure tell the peer why before giving up.
async fn reject_on_error<T>(conn: &Connection, result: SyncResult<T>) -> SyncResult<T> {
    if let Err(SyncError::Authentication(reason)) = &result {
        warn!(remote = %conn.remote(), %reason, "Rejecting peer");
        let reject = Frame::Reject {
            reason: reason.clone(),
        };
        if let Ok(bytes) = reject.encode() {
            // The peer may already be gone
            let _ = conn.send(bytes).await;
        }
    }
    result
}

fn unexpected(frame: Frame) -> SyncError {
    SyncError::Authentication(format!("Unexpected {} frame during handshake", frame.kind()))
}

fn hello_body(hello: &Hello) -> SyncResult<Vec<u8>> {
    let fields = (
        &hello.peer_id,
        &hello.display_name,
        &hello.signing_key,
        &hello.agreement_key,
        &hello.challenge,
        &hello.transports,
        &hello.counter_signature,
    );
    let mut body = HELLO_CONTEXT.to_vec();
    body.extend(
        postcard::to_allocvec(&fields).map_err(|e| SyncError::Serialization(e.to_string()))?,
    );
    Ok(body)
}

/// Bytes a side signs to answer the other's challenge. `role` names the
/// signer so the two counter-signatures are never interchangeable.
fn transcript(
    role: &[u8],
    initiator_challenge: &[u8; 32],
    responder_challenge: &[u8; 32],
    initiator: &Did,
    responder: &Did,
) -> Vec<u8> {
    let mut out = TRANSCRIPT_CONTEXT.to_vec();
    out.extend_from_slice(role);
    out.push(0);
    out.extend_from_slice(initiator_challenge);
    out.extend_from_slice(responder_challenge);
    out.extend_from_slice(initiator.as_str().as_bytes());
    out.push(0);
    out.extend_from_slice(responder.as_str().as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentity;
    use crate::storage::Storage;
    use crate::transport::BearerProfile;
    use crate::types::TrustLevel;

    struct Side {
        identity: LocalIdentity,
        storage: Storage,
        registry: PeerRegistry,
    }

    impl Side {
        fn new(seed: u8) -> Self {
            let storage = Storage::in_memory().unwrap();
            Self {
                identity: LocalIdentity::from_seed(&[seed; 32]),
                registry: PeerRegistry::new(storage.clone()),
                storage,
            }
        }

        fn handshake(&self) -> Handshake<'_> {
            Handshake {
                identity: &self.identity,
                registry: &self.registry,
                display_name: Some("node"),
                transports: &[BearerKind::LocalNetwork],
            }
        }
    }

    fn pair() -> (Connection, Connection) {
        Connection::pair("a".into(), "b".into(), BearerProfile::local_network())
    }

    #[tokio::test]
    async fn test_mutual_authentication() {
        let (alice, bob) = (Side::new(1), Side::new(2));
        let (mut a, mut b) = pair();

        let (ha, hb) = (alice.handshake(), bob.handshake());

        let (left, right) = tokio::join!(
            ha.initiate(&mut a),
            hb.respond(&mut b)
        );
        let (left, right) = (left.unwrap(), right.unwrap());

        assert_eq!(left.session_key, right.session_key);
        assert!(left.first_contact && right.first_contact);
        assert_eq!(&left.peer.peer_id, bob.identity.peer_id());
        assert_eq!(&right.peer.peer_id, alice.identity.peer_id());
        assert_eq!(
            alice.registry.trust_of(bob.identity.peer_id()).unwrap(),
            Some(TrustLevel::FirstUse)
        );
    }

    #[tokio::test]
    async fn test_second_contact_is_known_with_fresh_key() {
        let (alice, bob) = (Side::new(1), Side::new(2));

        let (mut a, mut b) = pair();
        let (ha, hb) = (alice.handshake(), bob.handshake());
        let (first, _) = tokio::join!(
            ha.initiate(&mut a),
            hb.respond(&mut b)
        );
        let (mut a, mut b) = pair();
        let (ha, hb) = (alice.handshake(), bob.handshake());
        let (second, _) = tokio::join!(
            ha.initiate(&mut a),
            hb.respond(&mut b)
        );

        let (first, second) = (first.unwrap(), second.unwrap());
        assert!(!second.first_contact);
        assert_eq!(second.peer.contact_count, 2);
        assert_ne!(first.session_key, second.session_key);
    }

    #[tokio::test]
    async fn test_invalid_hello_signature_leaves_no_trace() {
        let (alice, bob) = (Side::new(1), Side::new(2));
        let (mut a, mut b) = pair();

        let mut hello = alice.handshake().hello([7u8; 32], None).unwrap();
        hello.signature[0] ^= 0xFF;
        a.send(Frame::Hello(hello).encode().unwrap()).await.unwrap();

        let err = bob.handshake().respond(&mut b).await.unwrap_err();
        assert!(matches!(err, SyncError::Authentication(_)));
        assert!(bob.registry.list().unwrap().is_empty());
        assert!(matches!(
            Frame::decode(&a.recv().await.unwrap()).unwrap(),
            Frame::Reject { .. }
        ));
    }

    #[tokio::test]
    async fn test_changed_keys_are_rejected() {
        let (alice, bob) = (Side::new(1), Side::new(2));
        let (mut a, mut b) = pair();
        let (ha, hb) = (alice.handshake(), bob.handshake());
        let (first, _) = tokio::join!(
            ha.initiate(&mut a),
            hb.respond(&mut b)
        );
        first.unwrap();

        // Bob's pin for alice no longer matches what alice presents
        let mut record = bob.registry.get(alice.identity.peer_id()).unwrap().unwrap();
        record.agreement_key = [9u8; 32];
        bob.storage.save_peer(&record).unwrap();

        let (mut a, mut b) = pair();
        let (ha, hb) = (alice.handshake(), bob.handshake());
        let (left, right) = tokio::join!(
            ha.initiate(&mut a),
            hb.respond(&mut b)
        );
        assert!(matches!(right, Err(SyncError::Authentication(_))));
        assert!(matches!(left, Err(SyncError::Authentication(_))));
    }

    #[tokio::test]
    async fn test_identifier_must_match_signing_key() {
        let (alice, bob) = (Side::new(1), Side::new(2));
        let mallory = LocalIdentity::from_seed(&[3u8; 32]);
        let (a, mut b) = pair();

        // Claims alice's identifier but signs with its own key
        let mut hello = alice.handshake().hello([7u8; 32], None).unwrap();
        hello.signing_key = mallory.signing_public_key();
        hello.signature = mallory.sign(&hello_body(&hello).unwrap());
        a.send(Frame::Hello(hello).encode().unwrap()).await.unwrap();

        assert!(matches!(
            bob.handshake().respond(&mut b).await,
            Err(SyncError::Authentication(_))
        ));
        assert!(bob.registry.list().unwrap().is_empty());
    }
}
