use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coffeeshop_core::{DomainError, DomainResult, ProductId, UserId};

/// Longest accepted product name, in characters.
pub const MAX_NAME_LEN: usize = 120;

/// Highest accepted discount, in percent.
pub const MAX_DISCOUNT: u32 = 100;

/// Highest accepted average rating.
pub const MAX_RATING: f64 = 5.0;

/// Caller-supplied fields of a new product.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductFields {
    pub name: String,
    pub price: f64,
    pub discount: u32,
    pub summary: String,
    pub description: String,
    pub category: String,
    pub ingredients: Vec<String>,
}

/// Partial update with `$set` semantics: only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductPatch {
    pub name: Option<String>,
    pub price: Option<f64>,
    pub discount: Option<u32>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub ingredients: Option<Vec<String>>,
}

impl ProductPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.price.is_none()
            && self.discount.is_none()
            && self.summary.is_none()
            && self.description.is_none()
            && self.category.is_none()
            && self.ingredients.is_none()
    }
}

/// Primary record: a product in the shop catalogue.
///
/// `images` and `thumbnail` hold object-store keys. They are written here in
/// the same transaction that enqueues the uploads, so a key may briefly point
/// at an object that does not exist yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub price: f64,
    pub discount: u32,
    pub summary: String,
    pub description: String,
    pub category: String,
    pub ingredients: Vec<String>,
    pub images: Vec<String>,
    /// Empty when the product has no thumbnail.
    pub thumbnail: String,
    pub ratings: f64,
    pub author: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// Build and validate a new record. Image keys are attached afterwards.
    pub fn create(
        id: ProductId,
        fields: ProductFields,
        author: Option<UserId>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let product = Self {
            id,
            name: fields.name.trim().to_string(),
            price: fields.price,
            discount: fields.discount,
            summary: fields.summary,
            description: fields.description,
            category: fields.category.trim().to_string(),
            ingredients: normalize_ingredients(fields.ingredients),
            images: Vec::new(),
            thumbnail: String::new(),
            ratings: 0.0,
            author,
            created_at: now,
            updated_at: now,
        };
        product.validate()?;
        Ok(product)
    }

    /// Apply a partial update. On error the record is left untouched.
    pub fn apply_patch(&mut self, patch: ProductPatch, now: DateTime<Utc>) -> DomainResult<()> {
        let mut next = self.clone();
        if let Some(name) = patch.name {
            next.name = name.trim().to_string();
        }
        if let Some(price) = patch.price {
            next.price = price;
        }
        if let Some(discount) = patch.discount {
            next.discount = discount;
        }
        if let Some(summary) = patch.summary {
            next.summary = summary;
        }
        if let Some(description) = patch.description {
            next.description = description;
        }
        if let Some(category) = patch.category {
            next.category = category.trim().to_string();
        }
        if let Some(ingredients) = patch.ingredients {
            next.ingredients = normalize_ingredients(ingredients);
        }
        next.validate()?;
        next.updated_at = now;
        *self = next;
        Ok(())
    }

    /// Point the record at a new thumbnail key, returning the previous one if
    /// there was one.
    pub fn replace_thumbnail(&mut self, key: impl Into<String>) -> Option<String> {
        let previous = std::mem::replace(&mut self.thumbnail, key.into());
        (!previous.is_empty()).then_some(previous)
    }

    pub fn add_images<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.images.extend(keys);
    }

    /// Every object-store key this record references.
    pub fn object_keys(&self) -> Vec<String> {
        let mut keys = self.images.clone();
        if !self.thumbnail.is_empty() {
            keys.push(self.thumbnail.clone());
        }
        keys
    }

    /// Check field constraints.
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.is_empty() {
            return Err(DomainError::validation("name is required"));
        }
        if self.name.chars().count() > MAX_NAME_LEN {
            return Err(DomainError::validation(format!(
                "name exceeds {MAX_NAME_LEN} characters"
            )));
        }
        if self.category.is_empty() {
            return Err(DomainError::validation("category is required"));
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(DomainError::validation("price must be a positive number"));
        }
        if self.discount > MAX_DISCOUNT {
            return Err(DomainError::validation(format!(
                "discount must be between 0 and {MAX_DISCOUNT}"
            )));
        }
        if !(0.0..=MAX_RATING).contains(&self.ratings) {
            return Err(DomainError::invariant("ratings out of range"));
        }
        Ok(())
    }
}

fn normalize_ingredients(ingredients: Vec<String>) -> Vec<String> {
    ingredients
        .into_iter()
        .map(|i| i.trim().to_string())
        .filter(|i| !i.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latte() -> ProductFields {
        ProductFields {
            name: "Latte".to_string(),
            price: 4.5,
            discount: 10,
            summary: "Espresso and steamed milk".to_string(),
            description: "A classic.".to_string(),
            category: "beverages".to_string(),
            ingredients: vec!["espresso".to_string(), "milk".to_string()],
        }
    }

    fn create(fields: ProductFields) -> DomainResult<Product> {
        Product::create(ProductId::new(), fields, None, Utc::now())
    }

    #[test]
    fn create_trims_and_normalizes() {
        let product = create(ProductFields {
            name: "  Flat White ".to_string(),
            ingredients: vec![" espresso ".to_string(), "   ".to_string()],
            ..latte()
        })
        .unwrap();

        assert_eq!(product.name, "Flat White");
        assert_eq!(product.ingredients, vec!["espresso".to_string()]);
        assert!(product.thumbnail.is_empty());
        assert_eq!(product.created_at, product.updated_at);
    }

    #[test]
    fn create_rejects_missing_name() {
        let err = create(ProductFields {
            name: "   ".to_string(),
            ..latte()
        })
        .unwrap_err();
        assert_eq!(err, DomainError::validation("name is required"));
    }

    #[test]
    fn create_rejects_non_positive_price() {
        for price in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let err = create(ProductFields { price, ..latte() }).unwrap_err();
            assert!(matches!(err, DomainError::Validation(_)), "price {price}");
        }
    }

    #[test]
    fn create_rejects_discount_over_limit() {
        let err = create(ProductFields {
            discount: 101,
            ..latte()
        })
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn patch_sets_only_present_fields() {
        let mut product = create(latte()).unwrap();
        let before = product.clone();
        let later = before.updated_at + chrono::Duration::seconds(5);

        product
            .apply_patch(
                ProductPatch {
                    price: Some(5.0),
                    ..ProductPatch::default()
                },
                later,
            )
            .unwrap();

        assert_eq!(product.price, 5.0);
        assert_eq!(product.name, before.name);
        assert_eq!(product.ingredients, before.ingredients);
        assert_eq!(product.created_at, before.created_at);
        assert_eq!(product.updated_at, later);
    }

    #[test]
    fn invalid_patch_leaves_record_untouched() {
        let mut product = create(latte()).unwrap();
        let before = product.clone();

        let err = product
            .apply_patch(
                ProductPatch {
                    name: Some("Mocha".to_string()),
                    discount: Some(150),
                    ..ProductPatch::default()
                },
                Utc::now(),
            )
            .unwrap_err();

        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(product, before);
    }

    #[test]
    fn replace_thumbnail_reports_previous_key() {
        let mut product = create(latte()).unwrap();
        assert_eq!(product.replace_thumbnail("a.png"), None);
        assert_eq!(product.replace_thumbnail("b.png"), Some("a.png".to_string()));
        assert_eq!(product.thumbnail, "b.png");
    }

    #[test]
    fn object_keys_include_thumbnail_only_when_set() {
        let mut product = create(latte()).unwrap();
        product.add_images(vec!["i1.png".to_string(), "i2.png".to_string()]);
        assert_eq!(product.object_keys(), vec!["i1.png", "i2.png"]);

        product.replace_thumbnail("t.png");
        assert_eq!(product.object_keys(), vec!["i1.png", "i2.png", "t.png"]);
    }

    #[test]
    fn empty_patch_is_detected() {
        assert!(ProductPatch::default().is_empty());
        assert!(
            !ProductPatch {
                summary: Some(String::new()),
                ..ProductPatch::default()
            }
            .is_empty()
        );
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 500,
                ..ProptestConfig::default()
            })]

            /// A record that passed validation stays valid after any patch that succeeds.
            #[test]
            fn successful_patch_keeps_record_valid(
                name in proptest::option::of("[A-Za-z ]{0,130}"),
                price in proptest::option::of(-10.0f64..100.0),
                discount in proptest::option::of(0u32..200),
                category in proptest::option::of("[a-z ]{0,10}"),
            ) {
                let mut product = create(latte()).unwrap();
                let patch = ProductPatch { name, price, discount, category, ..ProductPatch::default() };

                if product.apply_patch(patch, Utc::now()).is_ok() {
                    prop_assert!(product.validate().is_ok());
                }
            }

            /// Validation accepts exactly the documented price/discount ranges.
            #[test]
            fn price_and_discount_bounds(price in -10.0f64..100.0, discount in 0u32..200) {
                let result = create(ProductFields { price, discount, ..latte() });
                let expected_ok = price > 0.0 && discount <= MAX_DISCOUNT;
                prop_assert_eq!(result.is_ok(), expected_ok);
            }
        }
    }
}
