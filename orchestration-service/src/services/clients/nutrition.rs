//! Recipe and nutrition search over a Spoonacular-compatible HTTP API.

use super::{
    ensure_success, http_client, probe, require_key, ClientError, NutritionClient, RecipeQuery,
    RecipeSearchResult, RecipeSummary,
};
use crate::config::ServiceSettings;
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;

pub struct HttpNutritionClient {
    client: Client,
    base_url: String,
    api_key: Secret<String>,
}

impl HttpNutritionClient {
    pub fn new(settings: &ServiceSettings) -> Result<Self, ClientError> {
        Ok(Self {
            client: http_client()?,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: require_key(settings, "nutrition")?,
        })
    }

    fn query_params(query: &RecipeQuery) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("query", query.query.clone()),
            ("number", query.number.to_string()),
            ("addRecipeNutrition", "true".to_string()),
        ];
        if let Some(diet) = &query.diet {
            params.push(("diet", diet.clone()));
        }
        if !query.intolerances.is_empty() {
            params.push(("intolerances", query.intolerances.join(",")));
        }
        if let Some(max) = query.max_calories {
            params.push(("maxCalories", max.to_string()));
        }
        params
    }
}

#[async_trait]
impl NutritionClient for HttpNutritionClient {
    async fn search_recipes(&self, query: &RecipeQuery) -> Result<RecipeSearchResult, ClientError> {
        let url = format!("{}/recipes/complexSearch", self.base_url);

        tracing::debug!(query = %query.query, number = query.number, "Searching recipes");

        let response = self
            .client
            .get(&url)
            .header("x-api-key", self.api_key.expose_secret())
            .query(&Self::query_params(query))
            .send()
            .await?;

        let body: SearchResponse = ensure_success(response).await?.json().await?;

        Ok(RecipeSearchResult {
            total_results: body.total_results,
            results: body.results.into_iter().map(RecipeSummary::from).collect(),
        })
    }

    async fn health_check(&self) -> Result<(), ClientError> {
        probe(&self.client, &self.base_url).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
    #[serde(default)]
    total_results: u64,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    id: u64,
    title: String,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    nutrition: Option<Nutrition>,
}

#[derive(Debug, Deserialize)]
struct Nutrition {
    #[serde(default)]
    nutrients: Vec<Nutrient>,
}

#[derive(Debug, Deserialize)]
struct Nutrient {
    name: String,
    amount: f64,
}

impl From<SearchHit> for RecipeSummary {
    fn from(hit: SearchHit) -> Self {
        let calories = hit.nutrition.and_then(|n| {
            n.nutrients
                .into_iter()
                .find(|nutrient| nutrient.name.eq_ignore_ascii_case("calories"))
                .map(|nutrient| nutrient.amount)
        });
        RecipeSummary {
            id: hit.id,
            title: hit.title,
            image: hit.image,
            calories,
        }
    }
}
