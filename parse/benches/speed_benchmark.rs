use criterion::{criterion_group, criterion_main, Criterion};

static MODEL: &str = r#"
attacker[active]

principal Alice[
    knows public c0, c1
    knows private psk
    generates a, n
    ga = G^a
]

principal Bob[
    knows public c0, c1
    knows private psk
    generates b
    gb = G^b
]

Alice -> Bob: ga, n

principal Bob[
    ss = ga^b
    k1, k2 = HKDF(ss, psk, c0)
    e = AEAD_ENC(k1, c1, HASH(ga, gb, n))
]

Bob -> Alice: gb, e

principal Alice[
    ss_a = gb^a
    k1_a, k2_a = HKDF(ss_a, psk, c0)
    m = AEAD_DEC(k1_a, e, HASH(ga, gb, n))?
]

queries[
    confidentiality? c1
    authentication? Bob -> Alice: e
    freshness? n
]
"#;

pub fn bench_parsers(c: &mut Criterion) {
    let mut group = c.benchmark_group("Parsers");
    group.bench_function("Chumsky", |b| {
        b.iter(|| {
            let _model = verisym_parse::chumskyparse::parse_model(MODEL).0.unwrap();
        })
    });
    group.bench_function("Checked", |b| {
        b.iter(|| {
            let _model = verisym_parse::parse_model(MODEL).unwrap();
        })
    });
    group.finish();
}

criterion_group!(benches, bench_parsers);
criterion_main!(benches);
