use core::{fmt, hint::black_box};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use keyserve_core::{encode_request, read_response, types::DEFAULT_MAX_BLOB_LEN};
use keyserve_server::{IssuerGenerator, KeyAlgorithm, KeyService, ServerConfig};
use portable_atomic::{AtomicU64, Ordering};
use rcgen::KeyPair;
use std::{
    io::Write,
    net::{SocketAddr, TcpStream},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

static NEXT_NAME: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug)]
enum Pattern {
    /// Every client asks for its own new name.
    Distinct,
    /// All clients ask for the same new name.
    Coalesced,
    /// All clients ask for a name that is already issued.
    Cached,
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Distinct => write!(f, "distinct"),
            Pattern::Coalesced => write!(f, "coalesced"),
            Pattern::Cached => write!(f, "cached"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct BenchParams {
    concurrency: usize,
    pattern: Pattern,
}

fn fresh_name() -> String {
    format!("subject-{}", NEXT_NAME.fetch_add(1, Ordering::Relaxed))
}

fn fetch(addr: SocketAddr, name: &str) {
    let mut stream = TcpStream::connect(addr).expect("connect failed");
    stream
        .write_all(&encode_request(name).expect("invalid name"))
        .expect("send failed");
    let cred = read_response(&mut stream, DEFAULT_MAX_BLOB_LEN).expect("no credential");
    black_box(cred);
}

fn run_round(addr: SocketAddr, params: BenchParams) {
    let shared = match params.pattern {
        Pattern::Distinct => None,
        Pattern::Coalesced => Some(fresh_name()),
        Pattern::Cached => Some("cached-subject".to_string()),
    };

    thread::scope(|s| {
        for _ in 0..params.concurrency {
            let name = shared.clone().unwrap_or_else(fresh_name);
            s.spawn(move || fetch(addr, &name));
        }
    });
}

fn issuance_bench(c: &mut Criterion) {
    let issuer_key = KeyPair::generate().expect("issuer key");
    let generator = IssuerGenerator::from_pem(
        &issuer_key.serialize_pem(),
        "CN=Bench Issuer",
        KeyAlgorithm::EcdsaP256,
        30,
    )
    .expect("issuer");

    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), num_cpus::get());
    let service = KeyService::bind(&config, Arc::new(generator)).expect("bind failed");
    let addr = service.local_addr();
    let handle = service.handle();
    let reactor = service.spawn().expect("reactor thread");

    // Warm the cached subject.
    fetch(addr, "cached-subject");

    let concurrency_cases = [1, 8, 50];
    let pattern_cases = [Pattern::Distinct, Pattern::Coalesced, Pattern::Cached];

    let mut cases = Vec::new();
    for &concurrency in &concurrency_cases {
        for &pattern in &pattern_cases {
            cases.push(BenchParams {
                concurrency,
                pattern,
            });
        }
    }

    for params in &cases {
        let mut group = c.benchmark_group("issuance");
        group.throughput(Throughput::Elements(params.concurrency as u64));
        group.measurement_time(Duration::from_secs(5));

        group.bench_function(
            format!("clients/{}/pattern/{}", params.concurrency, params.pattern),
            |b| {
                b.iter_custom(|iters| {
                    let start = Instant::now();
                    for _ in 0..iters {
                        run_round(addr, *params);
                    }
                    start.elapsed()
                });
            },
        );

        group.finish();
    }

    handle.stop();
    if let Ok(Err(e)) = reactor.join() {
        eprintln!("reactor failed: {e}");
    }
}

criterion_group!(benches, issuance_bench);
criterion_main!(benches);
