//! Remote store contract, the HubSpot CRM v3 implementation, and entity-id input loading.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cwr_core::{Deal, DealPage, DealPropertyUpdate, EntityId, PaginationCursor};
use cwr_storage::{CrmHttpClient, FetchError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "cwr-adapters";

pub const DEFAULT_API_BASE: &str = "https://api.hubapi.com";
pub const DEFAULT_ENTITY_OBJECT: &str = "contacts";
pub const DEFAULT_ASSOCIATION_PROPERTY: &str = "associations.contact";
pub const DEFAULT_ID_COLUMN: &str = "Contact ID";

// Search results carry only the properties the request names; the resolver reads these two.
const DEAL_STAGE_PROPERTY: &str = "dealstage";
const CLOSE_DATE_PROPERTY: &str = "closedate";

/// Operations the reconciliation pipeline needs from the CRM.
#[async_trait]
pub trait CrmStore: Send + Sync {
    fn store_id(&self) -> &'static str;

    /// One page of deals associated with `entity_id`, starting at `after`.
    async fn search_deals(
        &self,
        entity_id: &EntityId,
        after: Option<&PaginationCursor>,
        limit: usize,
    ) -> Result<DealPage, FetchError>;

    async fn patch_entity_property(
        &self,
        entity_id: &EntityId,
        property: &str,
        value: &str,
    ) -> Result<(), FetchError>;

    async fn batch_update_deals(&self, updates: &[DealPropertyUpdate]) -> Result<(), FetchError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubSpotEndpoints {
    pub api_base: String,
    pub entity_object: String,
    pub association_property: String,
}

impl Default for HubSpotEndpoints {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            entity_object: DEFAULT_ENTITY_OBJECT.to_string(),
            association_property: DEFAULT_ASSOCIATION_PROPERTY.to_string(),
        }
    }
}

impl HubSpotEndpoints {
    fn base(&self) -> &str {
        self.api_base.trim_end_matches('/')
    }

    pub fn deal_search_url(&self) -> String {
        format!("{}/crm/v3/objects/deals/search", self.base())
    }

    pub fn deal_batch_update_url(&self) -> String {
        format!("{}/crm/v3/objects/deals/batch/update", self.base())
    }

    pub fn entity_url(&self, entity_id: &EntityId) -> String {
        format!(
            "{}/crm/v3/objects/{}/{}",
            self.base(),
            self.entity_object,
            entity_id
        )
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    #[serde(rename = "filterGroups")]
    filter_groups: Vec<FilterGroup<'a>>,
    properties: [&'static str; 2],
    limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    after: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct FilterGroup<'a> {
    filters: Vec<Filter<'a>>,
}

#[derive(Debug, Serialize)]
struct Filter<'a> {
    #[serde(rename = "propertyName")]
    property_name: &'a str,
    operator: &'static str,
    value: &'a str,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<HubspotDeal>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    #[serde(default)]
    next: Option<PagingNext>,
}

#[derive(Debug, Deserialize)]
struct PagingNext {
    #[serde(default)]
    after: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HubspotDeal {
    id: String,
    #[serde(default)]
    properties: DealProperties,
}

#[derive(Debug, Default, Deserialize)]
struct DealProperties {
    #[serde(default)]
    dealstage: Option<String>,
    #[serde(default)]
    closedate: Option<String>,
}

#[derive(Debug, Serialize)]
struct PropertiesPatch<'a> {
    properties: BTreeMap<&'a str, &'a str>,
}

#[derive(Debug, Serialize)]
struct BatchUpdateRequest<'a> {
    inputs: Vec<BatchInput<'a>>,
}

#[derive(Debug, Serialize)]
struct BatchInput<'a> {
    id: &'a str,
    properties: BTreeMap<&'a str, &'a str>,
}

fn search_request<'a>(
    association_property: &'a str,
    entity_id: &'a EntityId,
    after: Option<&'a PaginationCursor>,
    limit: usize,
) -> SearchRequest<'a> {
    SearchRequest {
        filter_groups: vec![FilterGroup {
            filters: vec![Filter {
                property_name: association_property,
                operator: "EQ",
                value: entity_id.as_str(),
            }],
        }],
        properties: [DEAL_STAGE_PROPERTY, CLOSE_DATE_PROPERTY],
        limit,
        after: after.map(PaginationCursor::as_str),
    }
}

fn deal_page_from_response(response: SearchResponse) -> DealPage {
    let deals = response
        .results
        .into_iter()
        .map(|deal| Deal {
            id: deal.id,
            stage: deal.properties.dealstage.unwrap_or_default(),
            close_date: deal.properties.closedate,
        })
        .collect();
    let next_cursor = response
        .paging
        .and_then(|p| p.next)
        .and_then(|n| n.after)
        .filter(|after| !after.is_empty())
        .map(PaginationCursor::new);
    DealPage { deals, next_cursor }
}

fn batch_update_request(updates: &[DealPropertyUpdate]) -> BatchUpdateRequest<'_> {
    BatchUpdateRequest {
        inputs: updates
            .iter()
            .map(|update| BatchInput {
                id: &update.deal_id,
                properties: BTreeMap::from([(update.property.as_str(), update.value.as_str())]),
            })
            .collect(),
    }
}

/// HubSpot CRM v3 over a shared [`CrmHttpClient`].
#[derive(Debug)]
pub struct HubSpotStore {
    http: CrmHttpClient,
    endpoints: HubSpotEndpoints,
}

impl HubSpotStore {
    pub fn new(http: CrmHttpClient, endpoints: HubSpotEndpoints) -> Self {
        Self { http, endpoints }
    }

    pub fn endpoints(&self) -> &HubSpotEndpoints {
        &self.endpoints
    }
}

#[async_trait]
impl CrmStore for HubSpotStore {
    fn store_id(&self) -> &'static str {
        "hubspot"
    }

    async fn search_deals(
        &self,
        entity_id: &EntityId,
        after: Option<&PaginationCursor>,
        limit: usize,
    ) -> Result<DealPage, FetchError> {
        let body = search_request(&self.endpoints.association_property, entity_id, after, limit);
        let response: SearchResponse = self
            .http
            .post_json(&self.endpoints.deal_search_url(), &body)
            .await?;
        let page = deal_page_from_response(response);
        debug!(
            %entity_id,
            deals = page.deals.len(),
            has_next = page.next_cursor.is_some(),
            "deal search page"
        );
        Ok(page)
    }

    async fn patch_entity_property(
        &self,
        entity_id: &EntityId,
        property: &str,
        value: &str,
    ) -> Result<(), FetchError> {
        let body = PropertiesPatch {
            properties: BTreeMap::from([(property, value)]),
        };
        self.http
            .patch_json(&self.endpoints.entity_url(entity_id), &body)
            .await
    }

    async fn batch_update_deals(&self, updates: &[DealPropertyUpdate]) -> Result<(), FetchError> {
        let body = batch_update_request(updates);
        self.http
            .post(&self.endpoints.deal_batch_update_url(), &body)
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("opening entity id input {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading entity id rows: {0}")]
    Csv(#[from] csv::Error),
    #[error("column {column:?} not found; available columns: {available:?}")]
    MissingColumn {
        column: String,
        available: Vec<String>,
    },
}

/// Read entity ids from the named column of a CSV file, in row order.
pub fn load_entity_ids(path: impl AsRef<Path>, column: &str) -> Result<Vec<EntityId>, InputError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| InputError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    read_entity_ids(file, column)
}

/// Blank cells are skipped; duplicates are kept.
pub fn read_entity_ids<R: Read>(reader: R, column: &str) -> Result<Vec<EntityId>, InputError> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let wanted = column.trim();
    let Some(index) = headers.iter().position(|h| h == wanted) else {
        return Err(InputError::MissingColumn {
            column: wanted.to_string(),
            available: headers.iter().map(str::to_string).collect(),
        });
    };

    let mut ids = Vec::new();
    for row in rdr.records() {
        let row = row?;
        match row.get(index) {
            Some(value) if !value.is_empty() => ids.push(EntityId::new(value)),
            _ => {}
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_page_request_omits_cursor() {
        let entity = EntityId::new("C1");
        let body = search_request(DEFAULT_ASSOCIATION_PROPERTY, &entity, None, 100);
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "filterGroups": [{
                    "filters": [{
                        "propertyName": "associations.contact",
                        "operator": "EQ",
                        "value": "C1"
                    }]
                }],
                "properties": ["dealstage", "closedate"],
                "limit": 100
            })
        );
    }

    #[test]
    fn search_names_the_properties_the_resolver_reads() {
        let entity = EntityId::new("C1");
        let body = serde_json::to_value(search_request(DEFAULT_ASSOCIATION_PROPERTY, &entity, None, 100)).unwrap();
        assert_eq!(body["properties"], json!([DEAL_STAGE_PROPERTY, CLOSE_DATE_PROPERTY]));

        // Without them a result comes back with neither stage nor close date.
        let response: SearchResponse = serde_json::from_value(json!({
            "results": [{ "id": "D1", "properties": { "hs_object_id": "D1" } }]
        }))
        .unwrap();
        let page = deal_page_from_response(response);
        assert_eq!(page.deals[0].stage, "");
        assert_eq!(page.deals[0].close_date, None);
    }

    #[test]
    fn follow_up_request_carries_cursor() {
        let entity = EntityId::new("C1");
        let cursor = PaginationCursor::new("200");
        let body = search_request(DEFAULT_ASSOCIATION_PROPERTY, &entity, Some(&cursor), 50);
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["after"], json!("200"));
        assert_eq!(value["limit"], json!(50));
    }

    #[test]
    fn search_response_maps_deals_and_cursor() {
        let response: SearchResponse = serde_json::from_value(json!({
            "total": 3,
            "results": [
                {"id": "D1", "properties": {"dealstage": "closedwon", "closedate": "2023-01-10T00:00:00.000Z", "hs_object_id": "D1"}},
                {"id": "D2", "properties": {"dealstage": null, "closedate": null}},
                {"id": "D3"}
            ],
            "paging": {"next": {"after": "3", "link": "?after=3"}}
        }))
        .unwrap();
        let page = deal_page_from_response(response);

        assert_eq!(page.deals.len(), 3);
        assert_eq!(page.deals[0].stage, "closedwon");
        assert_eq!(page.deals[0].close_date.as_deref(), Some("2023-01-10T00:00:00.000Z"));
        assert_eq!(page.deals[1].stage, "");
        assert!(page.deals[2].close_date.is_none());
        assert_eq!(page.next_cursor, Some(PaginationCursor::new("3")));
    }

    #[test]
    fn last_page_has_no_cursor() {
        for body in [
            json!({"results": []}),
            json!({"results": [], "paging": {}}),
            json!({"results": [], "paging": {"next": {"after": ""}}}),
        ] {
            let response: SearchResponse = serde_json::from_value(body).unwrap();
            assert!(deal_page_from_response(response).next_cursor.is_none());
        }
    }

    #[test]
    fn batch_update_body_lists_every_deal() {
        let updates = vec![
            DealPropertyUpdate {
                deal_id: "D1".into(),
                property: "deal_type".into(),
                value: "New Business".into(),
            },
            DealPropertyUpdate {
                deal_id: "D2".into(),
                property: "deal_type".into(),
                value: "New Business".into(),
            },
        ];
        assert_eq!(
            serde_json::to_value(batch_update_request(&updates)).unwrap(),
            json!({
                "inputs": [
                    {"id": "D1", "properties": {"deal_type": "New Business"}},
                    {"id": "D2", "properties": {"deal_type": "New Business"}}
                ]
            })
        );
    }

    #[test]
    fn endpoint_urls_tolerate_trailing_slash() {
        let endpoints = HubSpotEndpoints {
            api_base: "https://api.hubapi.com/".into(),
            ..HubSpotEndpoints::default()
        };
        assert_eq!(endpoints.deal_search_url(), "https://api.hubapi.com/crm/v3/objects/deals/search");
        assert_eq!(
            endpoints.deal_batch_update_url(),
            "https://api.hubapi.com/crm/v3/objects/deals/batch/update"
        );
        assert_eq!(
            endpoints.entity_url(&EntityId::new("501")),
            "https://api.hubapi.com/crm/v3/objects/contacts/501"
        );
    }

    #[test]
    fn reads_named_column_in_row_order() {
        let csv = "Name,Contact ID,Owner\nAda, 101 ,x\nBob,,y\nCy,202,z\nDee,101,w\n";
        let ids = read_entity_ids(csv.as_bytes(), DEFAULT_ID_COLUMN).unwrap();
        assert_eq!(
            ids,
            vec![EntityId::new("101"), EntityId::new("202"), EntityId::new("101")]
        );
    }

    #[test]
    fn missing_column_lists_available_headers() {
        let csv = "Name,Email\nAda,ada@example.test\n";
        let err = read_entity_ids(csv.as_bytes(), DEFAULT_ID_COLUMN).unwrap_err();
        match err {
            InputError::MissingColumn { column, available } => {
                assert_eq!(column, "Contact ID");
                assert_eq!(available, vec!["Name".to_string(), "Email".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
