use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::{ExpectedNonce, RunConfig};
use crate::crypto::{KeyPair, PublicKey};
use crate::onion::{form_onion, Metadata, OnionRequest, Path, Role};
use crate::relay::intake::{serve_lines, IntakeSummary};
use crate::relay::{
    ChannelTransport, Delivery, DropCause, Envelope, Outcome, Relay, Transport, Verification,
};

const CLIENT: &str = "http://client.test";

struct Network {
    path: Path,
    relays: HashMap<String, Arc<Relay>>,
    inboxes: HashMap<String, UnboundedReceiver<Delivery>>,
    outbox: UnboundedReceiver<Envelope>,
    public_keys: Vec<PublicKey>,
    rng: StdRng,
}

impl Network {
    fn new(seed: u64, l1: usize, l2: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mixers = (1..=l1).map(|i| format!("http://mixer{i}.test")).collect();
        let gatekeepers = (1..=l2).map(|i| format!("http://gatekeeper{i}.test")).collect();
        let path = Path::new(mixers, gatekeepers, "http://recipient.test".into()).unwrap();

        let (transport, outbox) = ChannelTransport::new();
        let transport: Arc<dyn Transport> = Arc::new(transport);
        let mut relays = HashMap::new();
        let mut inboxes = HashMap::new();
        let mut public_keys = Vec::new();
        for layer in 1..=path.len() {
            let address = path.hop(layer).to_string();
            let (relay, inbox) =
                Relay::new(address.clone(), KeyPair::generate(&mut rng), Arc::clone(&transport));
            public_keys.push(relay.public_key());
            relays.insert(address.clone(), Arc::new(relay));
            inboxes.insert(address, inbox);
        }

        Self {
            path,
            relays,
            inboxes,
            outbox,
            public_keys,
            rng,
        }
    }

    fn relay(&self, layer: usize) -> &Arc<Relay> {
        &self.relays[self.path.hop(layer)]
    }

    /// Install the same run everywhere; each relay learns the nonces for its layer.
    fn start_run(&self, d: usize, checkpoints: &[(usize, &str)]) {
        self.start_run_with(d, None, checkpoints);
    }

    fn start_run_with(&self, d: usize, max_bruises: Option<usize>, checkpoints: &[(usize, &str)]) {
        for layer in 1..=self.path.len() {
            let expected = checkpoints
                .iter()
                .filter(|(at, _)| *at == layer)
                .map(|(at, nonce)| ExpectedNonce { nonce: nonce.to_string(), layer: *at })
                .collect();
            let run = RunConfig {
                run_id: "run-1".into(),
                bruise_tolerance: d,
                max_bruises,
                expected,
            };
            self.relay(layer).start_run(&run).unwrap();
        }
    }

    fn envelope(&mut self, message: &[u8], d: usize, metadata: Vec<Metadata>) -> Envelope {
        let formed = form_onion(
            &OnionRequest {
                message,
                path: &self.path,
                public_keys: &self.public_keys,
                metadata: &metadata,
                bruise_tolerance: d,
            },
            &mut self.rng,
        )
        .unwrap();
        Envelope {
            to: self.path.hop(1).to_string(),
            from: CLIENT.into(),
            onion: formed.first().unwrap().to_wire().unwrap(),
        }
    }

    /// Feed `envelope` in and follow it until it is delivered or dropped.
    async fn route(&mut self, mut envelope: Envelope) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        loop {
            let relay = Arc::clone(&self.relays[&envelope.to]);
            let outcome = relay.receive(envelope).await;
            let forwarded = matches!(outcome, Outcome::Forwarded { .. });
            outcomes.push(outcome);
            if !forwarded {
                return outcomes;
            }
            envelope = tokio::time::timeout(Duration::from_secs(5), self.outbox.recv())
                .await
                .unwrap()
                .unwrap();
        }
    }
}

fn nonces(l: usize, at: &[usize]) -> Vec<Metadata> {
    (1..=l)
        .map(|layer| {
            if at.contains(&layer) {
                Metadata::with_nonce(format!("nonce-{layer}"))
            } else {
                Metadata::default()
            }
        })
        .collect()
}

#[tokio::test]
async fn test_plain_onion_is_delivered() {
    let mut net = Network::new(1, 3, 2);
    net.start_run(2, &[]);
    let envelope = net.envelope(b"hello relays", 2, nonces(6, &[]));

    let outcomes = net.route(envelope).await;
    assert_eq!(outcomes.len(), 6);
    assert_eq!(
        outcomes[0],
        Outcome::Forwarded {
            layer: 1,
            role: Role::Mixer,
            next_hop: "http://mixer2.test".into(),
            verification: Verification::Unchecked,
        }
    );
    assert!(matches!(outcomes[4], Outcome::Forwarded { role: Role::LastGatekeeper, .. }));
    assert_eq!(
        outcomes[5],
        Outcome::Delivered { layer: 6, verification: Verification::Unchecked }
    );

    let inbox = net.inboxes.get_mut("http://recipient.test").unwrap();
    let delivery = inbox.recv().await.unwrap();
    assert_eq!(delivery.message, b"hello relays");
    assert_eq!(delivery.from, "http://gatekeeper2.test");
    assert_eq!(net.relay(6).stats().snapshot().delivered, 1);
    assert_eq!(net.relay(1).stats().snapshot().forwarded, 1);
}

#[tokio::test]
async fn test_checkpoints_matched_along_path() {
    let mut net = Network::new(2, 3, 2);
    let checkpoints = [(1, "nonce-1"), (2, "nonce-2"), (4, "nonce-4"), (6, "nonce-6")];
    net.start_run(2, &checkpoints);
    let envelope = net.envelope(b"checkpoint", 2, nonces(6, &[1, 2, 4, 6]));

    let outcomes = net.route(envelope).await;
    let verifications: Vec<Verification> = outcomes
        .iter()
        .map(|outcome| match outcome {
            Outcome::Forwarded { verification, .. } | Outcome::Delivered { verification, .. } => {
                *verification
            }
            Outcome::Dropped { cause } => panic!("dropped: {cause}"),
        })
        .collect();
    assert_eq!(
        verifications,
        vec![
            Verification::Checkpoint,
            Verification::Checkpoint,
            Verification::Unchecked,
            Verification::Checkpoint,
            Verification::Unchecked,
            Verification::Checkpoint,
        ]
    );
    assert_eq!(net.relay(4).stats().layer(4).checkpoints, 1);
    assert_eq!(net.relay(3).stats().snapshot().checkpoints, 0);
}

#[tokio::test]
async fn test_single_bruise_within_tolerance() {
    let mut net = Network::new(3, 3, 2);
    net.start_run(2, &[(1, "nonce-1")]);
    // Mixer 2 was never told about nonce-2.
    let envelope = net.envelope(b"one bruise", 2, nonces(6, &[1, 2]));

    let outcomes = net.route(envelope).await;
    assert!(matches!(
        outcomes[1],
        Outcome::Forwarded { verification: Verification::Bruised, .. }
    ));
    assert!(matches!(outcomes[5], Outcome::Delivered { .. }));
    assert_eq!(net.relay(2).stats().layer(2).bruises, 1);
}

#[tokio::test]
async fn test_tolerance_exhausted_dropped_at_gatekeeper() {
    let mut net = Network::new(4, 3, 2);
    net.start_run(2, &[]);
    let envelope = net.envelope(b"two bruises", 2, nonces(6, &[1, 3]));

    let outcomes = net.route(envelope).await;
    assert_eq!(outcomes.len(), 4);
    assert_eq!(outcomes[3], Outcome::Dropped { cause: DropCause::BruiseThreshold });
    assert_eq!(net.relay(4).stats().snapshot().dropped_bruise_threshold, 1);
}

#[tokio::test]
async fn test_third_bruise_stops_at_next_mixer() {
    let mut net = Network::new(5, 4, 1);
    net.start_run(3, &[]);
    let envelope = net.envelope(b"three bruises", 3, nonces(6, &[1, 2, 3]));

    let outcomes = net.route(envelope).await;
    assert_eq!(outcomes.len(), 4);
    assert!(outcomes[..3]
        .iter()
        .all(|o| matches!(o, Outcome::Forwarded { verification: Verification::Bruised, .. })));
    assert_eq!(outcomes[3], Outcome::Dropped { cause: DropCause::SepalMismatch });
}

#[tokio::test]
async fn test_gatekeeper_bruise_over_strict_threshold() {
    let mut net = Network::new(6, 2, 2);
    net.start_run(1, &[]);
    let envelope = net.envelope(b"gatekeeper bruise", 1, nonces(5, &[3]));

    let outcomes = net.route(envelope).await;
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[2], Outcome::Dropped { cause: DropCause::BruiseThreshold });
    assert_eq!(net.relay(3).stats().layer(3).bruises, 1);
}

#[tokio::test]
async fn test_garbage_is_dropped() {
    let mut net = Network::new(7, 1, 1);
    net.start_run(1, &[]);
    let envelope = Envelope {
        to: net.path.hop(1).to_string(),
        from: CLIENT.into(),
        onion: "definitely not an onion".into(),
    };

    let outcomes = net.route(envelope).await;
    assert_eq!(outcomes, vec![Outcome::Dropped { cause: DropCause::Undecodable }]);
}

#[tokio::test]
async fn test_onion_for_other_relay_is_dropped() {
    let mut net = Network::new(8, 2, 1);
    net.start_run(1, &[]);
    let mut envelope = net.envelope(b"misrouted", 1, nonces(4, &[]));
    envelope.to = net.path.hop(2).to_string();

    let outcomes = net.route(envelope).await;
    assert_eq!(outcomes, vec![Outcome::Dropped { cause: DropCause::Undecodable }]);
}

#[tokio::test]
async fn test_receive_waits_for_run() {
    let mut net = Network::new(9, 1, 1);
    let envelope = net.envelope(b"early", 1, nonces(3, &[]));
    let relay = Arc::clone(net.relay(1));

    let pending = tokio::spawn({
        let relay = Arc::clone(&relay);
        async move { relay.receive(envelope).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());
    assert!(relay.current_run().is_none());

    net.start_run(1, &[]);
    let outcome = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Outcome::Forwarded { layer: 1, .. }));
    assert_eq!(relay.current_run().unwrap().run_id, "run-1");
}

#[tokio::test]
async fn test_failed_forward_is_only_counted() {
    let mut rng = StdRng::seed_from_u64(10);
    let (transport, outbox) = ChannelTransport::new();
    drop(outbox);
    let keys: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate(&mut rng)).collect();
    let public_keys: Vec<PublicKey> = keys.iter().map(KeyPair::public_key).collect();
    let path = Path::new(vec!["http://m".into()], vec!["http://g".into()], "http://r".into()).unwrap();
    let formed = form_onion(
        &OnionRequest {
            message: b"into the void",
            path: &path,
            public_keys: &public_keys,
            metadata: &nonces(3, &[]),
            bruise_tolerance: 1,
        },
        &mut rng,
    )
    .unwrap();

    let mut keys = keys.into_iter();
    let (relay, _inbox) = Relay::new("http://m", keys.next().unwrap(), Arc::new(transport));
    relay
        .start_run(&RunConfig { run_id: "r".into(), bruise_tolerance: 1, ..RunConfig::default() })
        .unwrap();

    let envelope = Envelope {
        to: "http://m".into(),
        from: CLIENT.into(),
        onion: formed.first().unwrap().to_wire().unwrap(),
    };
    let outcome = relay.receive(envelope).await;
    assert!(matches!(outcome, Outcome::Forwarded { .. }));

    for _ in 0..100 {
        if relay.stats().snapshot().forward_failures == 1 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("forward failure was not recorded");
}

#[tokio::test]
async fn test_concurrent_receives_counted() {
    let mut net = Network::new(11, 1, 1);
    net.start_run(1, &[(1, "nonce-1")]);
    let relay = Arc::clone(net.relay(1));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let envelope = net.envelope(b"burst", 1, nonces(3, &[1]));
        let relay = Arc::clone(&relay);
        handles.push(tokio::spawn(async move { relay.receive(envelope).await }));
    }
    for handle in handles {
        assert!(matches!(handle.await.unwrap(), Outcome::Forwarded { .. }));
    }

    let snapshot = relay.stats().snapshot();
    assert_eq!(snapshot.received, 32);
    assert_eq!(snapshot.checkpoints, 32);
    assert_eq!(snapshot.per_layer[&1].checkpoints, 32);
}

#[tokio::test]
async fn test_withheld_master_key_counts_as_bruise_drop() {
    let mut net = Network::new(12, 3, 2);
    // A lenient threshold lets the onion reach the recipient with no key block left.
    net.start_run_with(2, Some(5), &[]);
    let envelope = net.envelope(b"lenient run", 2, nonces(6, &[1, 2]));

    let outcomes = net.route(envelope).await;
    assert_eq!(outcomes.len(), 6);
    assert_eq!(outcomes[5], Outcome::Dropped { cause: DropCause::BruiseThreshold });

    let snapshot = net.relay(6).stats().snapshot();
    assert_eq!(snapshot.dropped_bruise_threshold, 1);
    assert_eq!(snapshot.dropped_undecodable, 0);
}

#[tokio::test]
async fn test_recipient_drops_over_threshold() {
    let mut net = Network::new(13, 2, 1);
    net.start_run(1, &[]);
    let envelope = net.envelope(b"recipient bruise", 1, nonces(4, &[4]));

    let outcomes = net.route(envelope).await;
    assert_eq!(outcomes.len(), 4);
    assert_eq!(outcomes[3], Outcome::Dropped { cause: DropCause::BruiseThreshold });
    assert_eq!(net.relay(4).stats().layer(4).bruises, 1);
    assert_eq!(net.relay(4).stats().snapshot().delivered, 0);

    let inbox = net.inboxes.get_mut("http://recipient.test").unwrap();
    assert!(inbox.try_recv().is_err());
}

#[tokio::test]
async fn test_gatekeeper_bruises_are_not_summed() {
    // Each non-mixer judges its own mismatch plus what the sepal proves
    // about the mixers; gatekeepers do not learn about each other.
    let mut net = Network::new(14, 2, 3);
    net.start_run(2, &[]);
    let envelope = net.envelope(b"two gatekeepers", 2, nonces(6, &[3, 4]));

    let outcomes = net.route(envelope).await;
    assert!(matches!(
        outcomes[2],
        Outcome::Forwarded { role: Role::Gatekeeper, verification: Verification::Bruised, .. }
    ));
    assert!(matches!(
        outcomes[3],
        Outcome::Forwarded { role: Role::Gatekeeper, verification: Verification::Bruised, .. }
    ));
    assert!(matches!(outcomes[5], Outcome::Delivered { layer: 6, .. }));
}

#[tokio::test]
async fn test_new_run_resets_counters() {
    let mut net = Network::new(15, 1, 1);
    net.start_run(1, &[(1, "nonce-1")]);
    let envelope = net.envelope(b"first run", 1, nonces(3, &[1]));
    let relay = Arc::clone(net.relay(1));
    relay.receive(envelope).await;
    assert_eq!(relay.stats().snapshot().checkpoints, 1);

    relay
        .start_run(&RunConfig { run_id: "run-2".into(), bruise_tolerance: 1, ..RunConfig::default() })
        .unwrap();
    assert_eq!(relay.current_run().unwrap().run_id, "run-2");
    assert_eq!(relay.stats().snapshot().checkpoints, 0);
    assert_eq!(relay.stats().layer(1).checkpoints, 0);
}

fn lone_relay() -> Arc<Relay> {
    let (transport, _outbox) = ChannelTransport::new();
    let (relay, _inbox) = Relay::new(
        "http://lone.test",
        KeyPair::from_secret_bytes([7u8; 32]),
        Arc::new(transport),
    );
    Arc::new(relay)
}

#[tokio::test]
async fn test_intake_ends_without_run() {
    let relay = lone_relay();
    let input = b"{\"to\":\"http://lone.test\",\"from\":\"c\",\"onion\":\"AAAA\"}\n";
    let reader = tokio::io::BufReader::new(&input[..]);

    let summary = tokio::time::timeout(Duration::from_secs(5), serve_lines(relay, reader))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary, IntakeSummary { processed: 0, skipped: 0, abandoned: 1 });
}

#[tokio::test]
async fn test_intake_installs_run_then_processes() {
    let relay = lone_relay();
    let input = concat!(
        "{\"to\":\"http://lone.test\",\"from\":\"c\",\"onion\":\"AAAA\"}\n",
        "not json\n",
        "\n",
        "{\"run_id\":\"run-9\",\"bruise_tolerance\":1}\n",
        "{\"to\":\"http://lone.test\",\"from\":\"c\",\"onion\":\"AAAA\"}\n",
    );
    let reader = tokio::io::BufReader::new(input.as_bytes());

    let summary = tokio::time::timeout(Duration::from_secs(5), serve_lines(Arc::clone(&relay), reader))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary, IntakeSummary { processed: 2, skipped: 1, abandoned: 0 });
    assert_eq!(relay.stats().snapshot().dropped_undecodable, 2);
}
