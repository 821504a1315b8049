//! Credit package catalog.
//!
//! A static, code-configured table of the credit packages users can buy.
//! Consulted by the checkout orchestrator to price a session and by the
//! provider adapters to resolve credits from a provider product/variant id.
//!
//! # Example
//!
//! ```rust
//! use tollgate::catalog::Catalog;
//!
//! let catalog = Catalog::builder()
//!     .package("starter")
//!         .name("Starter")
//!         .credits(5)
//!         .price_minor(499, "usd")
//!         .provider_product("prod_starter")
//!         .done()
//!     .package("pro")
//!         .name("Pro")
//!         .credits(20)
//!         .price_minor(1499, "usd")
//!         .provider_product("prod_pro")
//!         .done()
//!     .build();
//!
//! assert_eq!(catalog.get("starter").unwrap().credits, 5);
//! assert_eq!(catalog.find_by_provider_product("prod_pro").unwrap().id, "pro");
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A purchasable credit package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreditPackage {
    /// Internal package identifier (e.g., "starter", "pro").
    pub id: String,
    /// Display name shown to users.
    pub name: String,
    /// Credits granted when a payment for this package settles.
    pub credits: i64,
    /// Price in minor currency units (cents).
    pub price_minor: i64,
    /// ISO currency code (e.g., "usd", "kes").
    pub currency: String,
    /// Provider-side product/variant identifier, used to resolve a webhook
    /// payload back to a package without trusting client-supplied amounts.
    pub provider_product_id: Option<String>,
}

impl CreditPackage {
    /// Price converted to another currency via a fixed rate table.
    ///
    /// Rates are minor-units-per-minor-unit; no live FX is consulted.
    #[must_use]
    pub fn price_in(&self, currency: &str, rate: f64) -> i64 {
        if self.currency == currency {
            return self.price_minor;
        }
        (self.price_minor as f64 * rate).round() as i64
    }
}

/// The static package catalog.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    packages: HashMap<String, CreditPackage>,
}

impl Catalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for constructing the catalog.
    #[must_use]
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::new()
    }

    /// Get a package by its internal id.
    #[must_use]
    pub fn get(&self, package_id: &str) -> Option<&CreditPackage> {
        self.packages.get(package_id)
    }

    /// Resolve a package from a provider product/variant identifier.
    #[must_use]
    pub fn find_by_provider_product(&self, provider_product_id: &str) -> Option<&CreditPackage> {
        self.packages
            .values()
            .find(|p| p.provider_product_id.as_deref() == Some(provider_product_id))
    }

    /// Check if a package exists.
    #[must_use]
    pub fn contains(&self, package_id: &str) -> bool {
        self.packages.contains_key(package_id)
    }

    /// Number of packages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Check if the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Iterate over all packages.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CreditPackage)> {
        self.packages.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Builder for the package catalog.
#[must_use = "builder does nothing until you call build()"]
pub struct CatalogBuilder {
    packages: HashMap<String, CreditPackage>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self {
            packages: HashMap::new(),
        }
    }

    /// Start configuring a package with the given id.
    pub fn package(self, id: impl Into<String>) -> PackageBuilder {
        PackageBuilder {
            catalog: self,
            package: CreditPackage {
                id: id.into(),
                name: String::new(),
                credits: 0,
                price_minor: 0,
                currency: "usd".to_string(),
                provider_product_id: None,
            },
        }
    }

    pub fn build(self) -> Catalog {
        Catalog {
            packages: self.packages,
        }
    }
}

impl Default for CatalogBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a single package inside [`CatalogBuilder`].
#[must_use = "call done() to add the package to the catalog"]
pub struct PackageBuilder {
    catalog: CatalogBuilder,
    package: CreditPackage,
}

impl PackageBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.package.name = name.into();
        self
    }

    pub fn credits(mut self, credits: i64) -> Self {
        self.package.credits = credits;
        self
    }

    pub fn price_minor(mut self, price_minor: i64, currency: impl Into<String>) -> Self {
        self.package.price_minor = price_minor;
        self.package.currency = currency.into();
        self
    }

    pub fn provider_product(mut self, product_id: impl Into<String>) -> Self {
        self.package.provider_product_id = Some(product_id.into());
        self
    }

    /// Finish this package and return to the catalog builder.
    pub fn done(mut self) -> CatalogBuilder {
        self.catalog
            .packages
            .insert(self.package.id.clone(), self.package);
        self.catalog
    }
}
