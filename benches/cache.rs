//! Cache and fetch path benchmarks.
//!
//! Run with: cargo bench --bench cache

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use encore::cache::{CacheConfig, CacheStore, QueryKey};
use encore::search::rank;
use encore::{EntityFetcher, InMemoryStore, ObserveOptions};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;
use types::{Document, FieldFilter, OrderDirection, QueryOptions};

fn create_runtime() -> Runtime {
  tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()
    .unwrap()
}

fn contact(i: usize) -> Document {
  Document::new(
    "contacts",
    format!("c{}", i),
    json!({
      "name": format!("Contact {}", i),
      "email": format!("contact{}@example.com", i),
      "structureId": format!("s{}", i % 20),
      "tags": ["booker", "press"]
    }),
  )
}

fn bench_entity(c: &mut Criterion) {
  let mut group = c.benchmark_group("entity");
  group.throughput(Throughput::Elements(1));

  let cache = CacheStore::default();
  for i in 0..500 {
    cache.set_entity("contacts", &format!("c{}", i), contact(i));
  }

  group.bench_function("get_hit", |b| {
    b.iter(|| black_box(cache.get_entity("contacts", "c250").is_ok()));
  });

  group.bench_function("get_miss", |b| {
    b.iter(|| black_box(cache.get_entity("contacts", "missing").is_err()));
  });

  let doc = contact(0);
  group.bench_function("set", |b| {
    b.iter(|| black_box(cache.set_entity("contacts", "c0", doc.clone())));
  });

  group.finish();
}

fn bench_eviction(c: &mut Criterion) {
  let mut group = c.benchmark_group("eviction");

  for max_items in [100usize, 1000].iter() {
    group.bench_with_input(
      BenchmarkId::from_parameter(max_items),
      max_items,
      |b, &max_items| {
        b.iter(|| {
          let cache = CacheStore::from_config(&CacheConfig::default().with_max_items(max_items));
          for i in 0..max_items * 2 {
            cache.set_entity("contacts", &format!("c{}", i), contact(i));
          }
          black_box(cache.len());
        });
      },
    );
  }

  group.finish();
}

fn bench_invalidate(c: &mut Criterion) {
  let mut group = c.benchmark_group("invalidate");

  group.bench_function("collection_of_500", |b| {
    b.iter(|| {
      let cache = CacheStore::default();
      for i in 0..500 {
        cache.set_entity("contacts", &format!("c{}", i), contact(i));
      }
      black_box(cache.invalidate("contacts", None));
    });
  });

  group.finish();
}

fn bench_query_key(c: &mut Criterion) {
  let options = QueryOptions::new()
    .filter(FieldFilter::eq("structureId", "s3"))
    .filter(FieldFilter::array_contains("tags", "press"))
    .order_by("name", OrderDirection::Asc)
    .limit(50);

  c.bench_function("query_key", |b| {
    b.iter(|| black_box(QueryKey::new("contacts", &options, &["name", "email"])));
  });
}

fn bench_rank(c: &mut Criterion) {
  let mut group = c.benchmark_group("rank");
  let fields = vec!["name".to_string(), "email".to_string()];

  for size in [100usize, 1000].iter() {
    let candidates: Vec<Document> = (0..*size).map(contact).collect();
    group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
      b.iter(|| black_box(rank("contact 1", candidates.clone(), &fields, 10)));
    });
  }

  group.finish();
}

fn bench_observe(c: &mut Criterion) {
  let rt = create_runtime();
  let mut group = c.benchmark_group("observe");

  let store = Arc::new(InMemoryStore::new());
  for i in 0..100 {
    let doc = contact(i);
    store.insert("contacts", &doc.id, doc.data).unwrap();
  }
  let cache = Arc::new(CacheStore::default());
  let fetcher = EntityFetcher::new(store, cache.clone());

  group.bench_function("cold", |b| {
    b.iter(|| {
      rt.block_on(async {
        cache.clear();
        let observer = fetcher.observe("contacts", "c42", ObserveOptions::one_shot());
        black_box(observer.settled().await);
      });
    });
  });

  group.bench_function("cached", |b| {
    b.iter(|| {
      rt.block_on(async {
        let observer = fetcher.observe("contacts", "c42", ObserveOptions::one_shot());
        black_box(observer.settled().await);
      });
    });
  });

  group.finish();
}

criterion_group!(
  benches,
  bench_entity,
  bench_eviction,
  bench_invalidate,
  bench_query_key,
  bench_rank,
  bench_observe,
);

criterion_main!(benches);
