use std::sync::Arc;
use std::time::Duration;

use indicatif::ProgressBar;

use crate::catalog::Product;
use crate::config::Config;
use crate::recommend::RecommendationService;
use crate::semantic::{build, EncoderPool, Snapshot};

pub mod fakes;

mod service;

use fakes::{image_url, product, FakeCatalog, FakeEncoder, FakeFetcher};

const TSHIRTS: (&str, &str, &str) = ("Apparel", "Topwear", "Tshirts");
const JEANS: (&str, &str, &str) = ("Apparel", "Bottomwear", "Jeans");
const SHOES: (&str, &str, &str) = ("Footwear", "Shoes", "Sneakers");

/// Small catalog with hand-placed vectors.
///
/// `broken` has an image url nothing serves.
pub fn catalog_fixture() -> (Vec<Product>, FakeFetcher) {
    let placed: [(&str, (&str, &str, &str), &[f32]); 7] = [
        ("t1", TSHIRTS, &[1.0, 0.0, 0.0]),
        ("t2", TSHIRTS, &[0.9, 0.1, 0.0]),
        ("t3", TSHIRTS, &[0.7, 0.7, 0.0]),
        ("t4", TSHIRTS, &[0.2, 1.0, 0.0]),
        ("j1", JEANS, &[0.95, 0.05, 0.0]),
        ("j2", JEANS, &[0.0, 0.0, 1.0]),
        ("s1", SHOES, &[0.0, 0.3, 1.0]),
    ];

    let mut products = vec![];
    let mut fetcher = FakeFetcher::new();
    for (id, category, vector) in placed {
        products.push(product(id, category));
        fetcher = fetcher.with_vector(&image_url(id), vector);
    }
    products.push(product("broken", TSHIRTS));

    (products, fetcher)
}

pub struct Fixture {
    pub catalog: Arc<FakeCatalog>,
    pub pool: Arc<EncoderPool>,
    pub config: Config,
    pub data_dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let (products, fetcher) = catalog_fixture();
        Self::with(products, fetcher)
    }

    pub fn with(products: Vec<Product>, fetcher: FakeFetcher) -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = Some(data_dir.path().to_path_buf());

        let pool = EncoderPool::new(
            Arc::new(FakeEncoder::new()),
            Arc::new(fetcher),
            4,
            Duration::from_secs(2),
            64,
        )
        .unwrap();

        Self {
            catalog: Arc::new(FakeCatalog::new(products)),
            pool: Arc::new(pool),
            config,
            data_dir,
        }
    }

    /// Store and index over every encodable catalog product.
    pub fn indexed_snapshot(&self) -> Snapshot {
        let products = crate::catalog::Catalog::products(self.catalog.as_ref(), 1000).unwrap();
        let (store, _) = build::build_store(&products, &self.pool, &ProgressBar::hidden());
        let index = store.build_index();
        Snapshot::new(store, Some(index))
    }

    pub fn service(&self, snapshot: Snapshot) -> RecommendationService {
        RecommendationService::new(self.catalog.clone(), self.pool.clone(), snapshot, &self.config)
            .unwrap()
    }

    pub fn on_the_fly(&self) -> RecommendationService {
        self.service(Snapshot::empty())
    }

    pub fn indexed(&self) -> RecommendationService {
        self.service(self.indexed_snapshot())
    }
}

/// Cosine of two fixture vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();
    dot / (norm(a) * norm(b))
}
