fn main() {
    println!("Run `cargo test -p session-compat` to execute end-to-end session tests.");
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use skiff_protocol::constants::MessageType;
    use skiff_protocol::envelope::Envelope;
    use skiff_protocol::messages::{
        ChannelManifest, CompletionReceipt, FileSpec, ManifestAck, ReconnectAnswer,
        ReconnectOffer, ResourceProfile,
    };
    use skiff_protocol::wire::{self, Frame};
    use skiff_recovery::{
        ConnectionFactory, ConnectionParams, ReconnectionCoordinator, RecoveryError,
        RelaySignaling, RetrySchedule, SessionStore,
    };
    use skiff_transfer::{
        ChannelState, ChannelTransport, SessionEvent, SessionOutcome, TransferConfig,
        TransferError, TransferOrchestrator, TransferSnapshot, TransferableFile,
    };

    /// In-process transport: frames sent on one side are pushed straight
    /// into the target orchestrator's frame handler.
    struct LoopbackTransport {
        target: Arc<TransferOrchestrator>,
        /// How the sending peer is known to the target.
        sender_id: String,
        channels: usize,
        states: Mutex<Vec<ChannelState>>,
    }

    impl LoopbackTransport {
        fn new(target: Arc<TransferOrchestrator>, sender_id: &str, channels: usize) -> Self {
            Self {
                target,
                sender_id: sender_id.to_string(),
                channels,
                states: Mutex::new(vec![ChannelState::Open; channels]),
            }
        }
    }

    impl ChannelTransport for LoopbackTransport {
        fn send(&self, channel_index: usize, frame: Vec<u8>) -> Result<(), TransferError> {
            self.target.handle_frame(&self.sender_id, channel_index, frame);
            Ok(())
        }

        fn backlog(&self, _channel_index: usize) -> usize {
            0
        }

        fn channel_count(&self) -> usize {
            self.channels
        }

        fn state(&self, channel_index: usize) -> ChannelState {
            self.states.lock().unwrap()[channel_index]
        }

        fn close(&self, channel_index: usize) {
            self.states.lock().unwrap()[channel_index] = ChannelState::Closed;
        }
    }

    /// Builds the two directed halves of a loopback link between two
    /// orchestrators. First element is the transport `a` uses to reach
    /// `b`, second the reverse.
    fn loopback_pair(
        a: &Arc<TransferOrchestrator>,
        a_id: &str,
        b: &Arc<TransferOrchestrator>,
        b_id: &str,
        channels: usize,
    ) -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
        (
            Arc::new(LoopbackTransport::new(Arc::clone(b), a_id, channels)),
            Arc::new(LoopbackTransport::new(Arc::clone(a), b_id, channels)),
        )
    }

    fn profile(channels: usize) -> ResourceProfile {
        ResourceProfile {
            available_memory: 256 * 1024 * 1024,
            proposed_channels: channels,
        }
    }

    /// Drains every buffered event into a vec.
    fn drain_events(rx: &mut tokio::sync::mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn delivered_contents(events: &[SessionEvent]) -> HashMap<String, Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::FileDelivered { path, data, .. } => {
                    Some((path.clone(), data.clone()))
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn bidirectional_session_delivers_every_file_once() {
        let a = Arc::new(TransferOrchestrator::new(TransferConfig::default()));
        let b = Arc::new(TransferOrchestrator::new(TransferConfig::default()));
        let mut a_events = a.take_events().unwrap();
        let mut b_events = b.take_events().unwrap();

        let (a_to_b, b_to_a) = loopback_pair(&a, "peer-a", &b, "peer-b", 4);
        a.register_channels("peer-b", a_to_b).unwrap();
        b.register_channels("peer-a", b_to_a).unwrap();

        // Sizes chosen to span multiple chunks and land on several channels.
        let a_files: Vec<TransferableFile> = (0..5)
            .map(|i| TransferableFile::new(format!("a/file{i}.bin"), vec![i as u8 + 1; 40_000 + i * 7_000]))
            .collect();
        let b_files: Vec<TransferableFile> = (0..3)
            .map(|i| TransferableFile::new(format!("b/file{i}.bin"), vec![0xB0 + i as u8; 25_000 + i * 11_000]))
            .collect();
        let a_expected: HashMap<String, Vec<u8>> =
            a_files.iter().map(|f| (f.path.clone(), f.content.clone())).collect();
        let b_expected: HashMap<String, Vec<u8>> =
            b_files.iter().map(|f| (f.path.clone(), f.content.clone())).collect();

        let prof = profile(4);
        let (a_outcome, b_outcome) = tokio::join!(
            a.begin("peer-b", a_files, &prof),
            b.begin("peer-a", b_files, &prof),
        );
        assert_eq!(a_outcome.unwrap(), SessionOutcome::Completed);
        assert_eq!(b_outcome.unwrap(), SessionOutcome::Completed);

        // B received exactly A's files, byte for byte, and vice versa.
        let b_seen = delivered_contents(&drain_events(&mut b_events));
        assert_eq!(b_seen, a_expected);
        let a_seen = delivered_contents(&drain_events(&mut a_events));
        assert_eq!(a_seen, b_expected);
    }

    #[tokio::test]
    async fn empty_sessions_on_both_sides_complete() {
        let a = Arc::new(TransferOrchestrator::new(TransferConfig::default()));
        let b = Arc::new(TransferOrchestrator::new(TransferConfig::default()));

        let (a_to_b, b_to_a) = loopback_pair(&a, "peer-a", &b, "peer-b", 2);
        a.register_channels("peer-b", a_to_b).unwrap();
        b.register_channels("peer-a", b_to_a).unwrap();

        let prof = profile(2);
        let (a_outcome, b_outcome) = tokio::join!(
            a.begin("peer-b", Vec::new(), &prof),
            b.begin("peer-a", Vec::new(), &prof),
        );
        assert_eq!(a_outcome.unwrap(), SessionOutcome::Completed);
        assert_eq!(b_outcome.unwrap(), SessionOutcome::Completed);
    }

    #[tokio::test]
    async fn zero_byte_file_is_delivered() {
        let a = Arc::new(TransferOrchestrator::new(TransferConfig::default()));
        let b = Arc::new(TransferOrchestrator::new(TransferConfig::default()));
        let mut b_events = b.take_events().unwrap();

        let (a_to_b, b_to_a) = loopback_pair(&a, "peer-a", &b, "peer-b", 1);
        a.register_channels("peer-b", a_to_b).unwrap();
        b.register_channels("peer-a", b_to_a).unwrap();

        let files = vec![TransferableFile::new("empty.marker", Vec::new())];
        let prof = profile(1);
        let (a_outcome, b_outcome) = tokio::join!(
            a.begin("peer-b", files, &prof),
            b.begin("peer-a", Vec::new(), &prof),
        );
        assert_eq!(a_outcome.unwrap(), SessionOutcome::Completed);
        assert_eq!(b_outcome.unwrap(), SessionOutcome::Completed);

        let seen = delivered_contents(&drain_events(&mut b_events));
        assert_eq!(seen.get("empty.marker"), Some(&Vec::new()));
    }

    /// Transport that accepts and discards everything, for driving one
    /// side of a session with forged frames.
    struct BlackholeTransport {
        channels: usize,
    }

    impl ChannelTransport for BlackholeTransport {
        fn send(&self, _channel_index: usize, _frame: Vec<u8>) -> Result<(), TransferError> {
            Ok(())
        }
        fn backlog(&self, _channel_index: usize) -> usize {
            0
        }
        fn channel_count(&self) -> usize {
            self.channels
        }
        fn state(&self, _channel_index: usize) -> ChannelState {
            ChannelState::Open
        }
        fn close(&self, _channel_index: usize) {}
    }

    fn control_frame<T: serde::Serialize>(msg_type: MessageType, payload: &T) -> Vec<u8> {
        let msg = Envelope::carrying(msg_type, payload).unwrap();
        wire::encode_control(&msg).unwrap()
    }

    #[tokio::test]
    async fn resume_sends_only_the_unconfirmed_remainder() {
        let a = Arc::new(TransferOrchestrator::new(TransferConfig::default()));
        a.register_channels("peer-b", Arc::new(BlackholeTransport { channels: 1 }))
            .unwrap();

        let files: Vec<TransferableFile> = (0..5)
            .map(|i| TransferableFile::new(format!("part{i}.bin"), vec![0x10 + i as u8; 3_000]))
            .collect();
        let confirmed: Vec<TransferableFile> = files[..2].to_vec();
        let remaining_paths: Vec<String> =
            files[2..].iter().map(|f| f.path.clone()).collect();

        let runner = {
            let a = Arc::clone(&a);
            let files = files.clone();
            tokio::spawn(async move { a.begin("peer-b", files, &profile(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Play the peer's side by hand: an empty manifest, the ack that
        // opens the barrier, then receipts for the first two files.
        a.handle_frame(
            "peer-b",
            0,
            control_frame(
                MessageType::Manifest,
                &ChannelManifest {
                    channel_index: 0,
                    files: Vec::new(),
                },
            ),
        );
        a.handle_frame(
            "peer-b",
            0,
            control_frame(MessageType::ManifestAck, &ManifestAck { channel_index: 0 }),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        for file in &confirmed {
            a.handle_frame(
                "peer-b",
                0,
                control_frame(
                    MessageType::CompletionReceipt,
                    &CompletionReceipt {
                        path: file.path.clone(),
                        hash: file.hash.clone(),
                        channel_index: 0,
                    },
                ),
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = a.connection_lost("peer-b").unwrap();
        assert_eq!(runner.await.unwrap().unwrap(), SessionOutcome::Dropped);

        assert_eq!(snapshot.confirmed_files.len(), 2);
        assert!(snapshot.confirmed_files.contains("part0.bin"));
        assert!(snapshot.confirmed_files.contains("part1.bin"));
        let pending: Vec<String> =
            snapshot.pending_files.iter().map(|f| f.path.clone()).collect();
        assert_eq!(pending, remaining_paths);
        assert_eq!(snapshot.bytes_transferred, 6_000);
        assert_eq!(snapshot.total_bytes, 15_000);

        // Reconnect over a real loopback and resume: the peer must see
        // exactly the three unconfirmed files.
        let b = Arc::new(TransferOrchestrator::new(TransferConfig::default()));
        let mut b_events = b.take_events().unwrap();
        let (a_to_b, b_to_a) = loopback_pair(&a, "peer-a", &b, "peer-b", 1);
        a.register_channels("peer-b", a_to_b).unwrap();
        b.register_channels("peer-a", b_to_a).unwrap();

        let prof = profile(1);
        let (resumed, received) = tokio::join!(
            a.resume("peer-b", &snapshot, &prof),
            b.begin("peer-a", Vec::new(), &prof),
        );
        assert_eq!(resumed.unwrap(), SessionOutcome::Completed);
        assert_eq!(received.unwrap(), SessionOutcome::Completed);

        let seen = delivered_contents(&drain_events(&mut b_events));
        let mut seen_paths: Vec<String> = seen.keys().cloned().collect();
        seen_paths.sort();
        assert_eq!(seen_paths, remaining_paths);
    }

    #[tokio::test]
    async fn duplicate_final_chunk_delivers_exactly_once() {
        let b = Arc::new(TransferOrchestrator::new(TransferConfig::default()));
        let mut b_events = b.take_events().unwrap();
        b.register_channels("peer-a", Arc::new(BlackholeTransport { channels: 1 }))
            .unwrap();

        let runner = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.begin("peer-a", Vec::new(), &profile(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let payload = vec![0x5A_u8; 4_096];
        let hash = skiff_transfer::checksum_bytes(&payload);
        b.handle_frame(
            "peer-a",
            0,
            control_frame(
                MessageType::Manifest,
                &ChannelManifest {
                    channel_index: 0,
                    files: vec![FileSpec {
                        path: "dup.bin".into(),
                        size: payload.len() as u64,
                        hash,
                    }],
                },
            ),
        );
        b.handle_frame(
            "peer-a",
            0,
            control_frame(MessageType::ManifestAck, &ManifestAck { channel_index: 0 }),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The final chunk arrives twice, as if the sender retried after
        // losing the receipt.
        let chunk = wire::encode_chunk(&skiff_protocol::wire::ChunkFrame {
            path: "dup.bin".into(),
            offset: 0,
            last: true,
            payload: payload.clone(),
        })
        .unwrap();
        b.handle_frame("peer-a", 0, chunk.clone());
        b.handle_frame("peer-a", 0, chunk);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = delivered_contents(&drain_events(&mut b_events));
        assert_eq!(seen.len(), 1, "exactly one delivery event");
        assert_eq!(seen.get("dup.bin"), Some(&payload));

        // The forged peer never raises its half of the close handshake.
        b.connection_lost("peer-a");
        assert_eq!(runner.await.unwrap().unwrap(), SessionOutcome::Dropped);
    }

    /// Transport that swallows frames but keeps a copy of everything
    /// sent, so tests can assert on outbound control traffic.
    struct RecordingTransport {
        channels: usize,
        frames: Mutex<Vec<(usize, Vec<u8>)>>,
    }

    impl RecordingTransport {
        fn new(channels: usize) -> Self {
            Self {
                channels,
                frames: Mutex::new(Vec::new()),
            }
        }

        fn sent_controls(&self) -> Vec<Envelope> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(_, bytes)| match wire::decode_frame(bytes) {
                    Ok(Frame::Control(msg)) => Some(msg),
                    _ => None,
                })
                .collect()
        }

        fn sent_receipts(&self) -> Vec<CompletionReceipt> {
            self.sent_controls()
                .iter()
                .filter(|msg| msg.msg_type == MessageType::CompletionReceipt)
                .filter_map(|msg| msg.parse_payload().ok())
                .collect()
        }
    }

    impl ChannelTransport for RecordingTransport {
        fn send(&self, channel_index: usize, frame: Vec<u8>) -> Result<(), TransferError> {
            self.frames.lock().unwrap().push((channel_index, frame));
            Ok(())
        }
        fn backlog(&self, _channel_index: usize) -> usize {
            0
        }
        fn channel_count(&self) -> usize {
            self.channels
        }
        fn state(&self, _channel_index: usize) -> ChannelState {
            ChannelState::Open
        }
        fn close(&self, _channel_index: usize) {}
    }

    #[tokio::test]
    async fn corrupted_file_is_withheld_until_a_clean_resend() {
        let b = Arc::new(TransferOrchestrator::new(TransferConfig::default()));
        let mut b_events = b.take_events().unwrap();
        let transport = Arc::new(RecordingTransport::new(1));
        b.register_channels("peer-a", Arc::clone(&transport) as Arc<dyn ChannelTransport>)
            .unwrap();

        let runner = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.begin("peer-a", Vec::new(), &profile(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let good = vec![0x42_u8; 2_048];
        let declared = skiff_transfer::checksum_bytes(&good);
        b.handle_frame(
            "peer-a",
            0,
            control_frame(
                MessageType::Manifest,
                &ChannelManifest {
                    channel_index: 0,
                    files: vec![FileSpec {
                        path: "patch.bin".into(),
                        size: good.len() as u64,
                        hash: declared,
                    }],
                },
            ),
        );
        b.handle_frame(
            "peer-a",
            0,
            control_frame(MessageType::ManifestAck, &ManifestAck { channel_index: 0 }),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The declared bytes arrive corrupted.
        let mut bad = good.clone();
        bad[0] ^= 0xFF;
        b.handle_frame(
            "peer-a",
            0,
            wire::encode_chunk(&skiff_protocol::wire::ChunkFrame {
                path: "patch.bin".into(),
                offset: 0,
                last: true,
                payload: bad,
            })
            .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        // No delivery, no receipt: the peer must notice the missing
        // receipt, not receive a false confirmation.
        assert!(
            drain_events(&mut b_events)
                .iter()
                .all(|e| !matches!(e, SessionEvent::FileDelivered { .. }))
        );
        assert!(transport.sent_receipts().is_empty());

        // A clean resend from offset zero completes the file.
        b.handle_frame(
            "peer-a",
            0,
            wire::encode_chunk(&skiff_protocol::wire::ChunkFrame {
                path: "patch.bin".into(),
                offset: 0,
                last: true,
                payload: good.clone(),
            })
            .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = delivered_contents(&drain_events(&mut b_events));
        assert_eq!(seen.get("patch.bin"), Some(&good));
        let receipts = transport.sent_receipts();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].path, "patch.bin");

        b.connection_lost("peer-a");
        assert_eq!(runner.await.unwrap().unwrap(), SessionOutcome::Dropped);
    }

    #[tokio::test]
    async fn duplicate_path_across_manifests_is_fatal() {
        let b = Arc::new(TransferOrchestrator::new(TransferConfig::default()));
        let mut b_events = b.take_events().unwrap();
        let transport = Arc::new(RecordingTransport::new(2));
        b.register_channels("peer-a", Arc::clone(&transport) as Arc<dyn ChannelTransport>)
            .unwrap();

        let runner = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.begin("peer-a", Vec::new(), &profile(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let spec = FileSpec {
            path: "twice.bin".into(),
            size: 16,
            hash: "ab".repeat(32),
        };
        for channel in 0..2_usize {
            b.handle_frame(
                "peer-a",
                channel,
                control_frame(
                    MessageType::Manifest,
                    &ChannelManifest {
                        channel_index: channel,
                        files: vec![spec.clone()],
                    },
                ),
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The second manifest re-declares the path: fatal, not retried.
        let outcome = runner.await.unwrap().unwrap();
        assert!(matches!(outcome, SessionOutcome::Failed(_)));

        let events = drain_events(&mut b_events);
        let failures = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::SessionFailed { .. }))
            .count();
        assert_eq!(failures, 1, "terminal failure surfaced exactly once");

        let rejections = transport
            .sent_controls()
            .iter()
            .filter(|msg| msg.msg_type == MessageType::Error)
            .count();
        assert_eq!(rejections, 1, "offending manifest answered with an error");
    }

    #[tokio::test]
    async fn receipts_off_their_contract_channel_still_close_every_channel() {
        let a = Arc::new(TransferOrchestrator::new(TransferConfig::default()));
        a.register_channels("peer-b", Arc::new(BlackholeTransport { channels: 2 }))
            .unwrap();

        // Largest-first assignment puts big.bin on channel 0 and
        // small.bin on channel 1.
        let big = TransferableFile::new("big.bin", vec![1_u8; 8_000]);
        let small = TransferableFile::new("small.bin", vec![2_u8; 100]);
        let receipts = [
            CompletionReceipt {
                path: big.path.clone(),
                hash: big.hash.clone(),
                channel_index: 1,
            },
            CompletionReceipt {
                path: small.path.clone(),
                hash: small.hash.clone(),
                channel_index: 1,
            },
        ];

        let runner = {
            let a = Arc::clone(&a);
            let files = vec![big, small];
            tokio::spawn(async move { a.begin("peer-b", files, &profile(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        for channel in 0..2_usize {
            a.handle_frame(
                "peer-b",
                channel,
                control_frame(
                    MessageType::Manifest,
                    &ChannelManifest {
                        channel_index: channel,
                        files: Vec::new(),
                    },
                ),
            );
            a.handle_frame(
                "peer-b",
                channel,
                control_frame(
                    MessageType::ManifestAck,
                    &ManifestAck { channel_index: channel },
                ),
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Both receipts arrive on channel 1, including big.bin's, which
        // was contracted to channel 0.
        for receipt in &receipts {
            a.handle_frame("peer-b", 1, control_frame(MessageType::CompletionReceipt, receipt));
        }
        for channel in 0..2_usize {
            a.handle_frame(
                "peer-b",
                channel,
                control_frame(
                    MessageType::ChannelDone,
                    &skiff_protocol::messages::ChannelDone { channel_index: channel },
                ),
            );
        }

        // Channel 0 still learns of big.bin's confirmation, so every
        // channel closes and the session completes.
        let outcome = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("session must not hang on misrouted receipts")
            .unwrap()
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Completed);
    }

    /// Relay that always answers for the offered session.
    struct EchoRelay;

    impl RelaySignaling for EchoRelay {
        fn relay_offer(
            &self,
            offer: ReconnectOffer,
        ) -> Pin<Box<dyn Future<Output = Result<ReconnectAnswer, RecoveryError>> + Send + '_>>
        {
            Box::pin(async move {
                Ok(ReconnectAnswer {
                    session_id: offer.session_id,
                    source_peer_id: offer.target_peer_id,
                    target_peer_id: offer.source_peer_id,
                    sdp_blob: "answer".into(),
                })
            })
        }
    }

    /// Factory that wires a fresh loopback link between the two test
    /// orchestrators and brings the remote side back up as a receiver.
    struct RebuildFactory {
        a: Arc<TransferOrchestrator>,
        b: Arc<TransferOrchestrator>,
    }

    impl ConnectionFactory for RebuildFactory {
        fn create_offer(
            &self,
            _params: ConnectionParams,
        ) -> Pin<Box<dyn Future<Output = Result<String, RecoveryError>> + Send + '_>> {
            Box::pin(async { Ok("offer".to_string()) })
        }

        fn establish(
            &self,
            _params: ConnectionParams,
            _answer: ReconnectAnswer,
        ) -> Pin<
            Box<
                dyn Future<Output = Result<Arc<dyn ChannelTransport>, RecoveryError>>
                    + Send
                    + '_,
            >,
        > {
            let a = Arc::clone(&self.a);
            let b = Arc::clone(&self.b);
            Box::pin(async move {
                let (a_to_b, b_to_a) = loopback_pair(&a, "peer-a", &b, "peer-b", 2);
                b.register_channels("peer-a", b_to_a)?;
                // The remote peer comes back as a pure receiver once the
                // local side has had a moment to register its transport.
                let receiver = Arc::clone(&b);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let _ = receiver.begin("peer-a", Vec::new(), &profile(2)).await;
                });
                Ok(a_to_b as Arc<dyn ChannelTransport>)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn coordinator_recovers_and_completes_a_dropped_session() {
        let a = Arc::new(TransferOrchestrator::new(TransferConfig::default()));
        let b = Arc::new(TransferOrchestrator::new(TransferConfig::default()));
        let mut b_events = b.take_events().unwrap();

        let files: Vec<TransferableFile> = (0..2)
            .map(|i| TransferableFile::new(format!("restore{i}.bin"), vec![0xC0 + i as u8; 9_000]))
            .collect();
        let snapshot = TransferSnapshot {
            peer_id: "peer-b".into(),
            session_id: "s-restore".into(),
            pending_files: files.iter().cloned().map(Arc::new).collect(),
            confirmed_files: Default::default(),
            delivered_files: Default::default(),
            delivered_hashes: Default::default(),
            bytes_transferred: 0,
            total_bytes: 18_000,
        };

        let store = Arc::new(SessionStore::new());
        let session_id = store.capture(
            "peer-b",
            ConnectionParams("relay://rendezvous".into()),
            snapshot,
        );
        assert_eq!(session_id, "s-restore");

        let coordinator = ReconnectionCoordinator::new(
            Arc::clone(&store),
            RetrySchedule::default(),
            Arc::new(EchoRelay),
            Arc::new(RebuildFactory {
                a: Arc::clone(&a),
                b: Arc::clone(&b),
            }),
        );

        let outcome = coordinator
            .run(&a, "s-restore", "peer-a", &profile(2))
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Completed);
        assert!(store.is_empty(), "finished session must leave the store");

        let seen = delivered_contents(&drain_events(&mut b_events));
        assert_eq!(seen.len(), 2);
        assert_eq!(seen.get("restore0.bin").map(Vec::len), Some(9_000));
        assert_eq!(seen.get("restore1.bin").map(Vec::len), Some(9_000));
    }
}
