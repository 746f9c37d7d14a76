//! End-to-end pipeline: harvest, normalization and aggregation driven by the scheduler

mod helpers;

use async_trait::async_trait;
use helpers::db_utils::{provider, test_config, test_env, TestEnv};
use recflow_common::{Record, RecordFilter, Repository, ServiceStatus};
use recflow_proc::db::{directives, schedules, services};
use recflow_proc::harvest::{HarvestClient, HarvestRequest, HarvestResponse, HarvestRunner, HarvestedRecord};
use recflow_proc::matching::{MatchEngine, MatchPointStore, ParsedRecord};
use recflow_proc::models::{DirectiveSource, NewDirective, ServiceInfo};
use recflow_proc::scheduler::JobScheduler;
use recflow_proc::services::lifecycle::register_service;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

const RECORDS: usize = 175;
const ISBN_GROUPS: usize = 7;

/// Provider answering every request with a preset record list
#[derive(Default)]
struct ScriptedProvider {
    records: Mutex<Vec<HarvestedRecord>>,
    requests: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn respond_with(&self, records: Vec<HarvestedRecord>) {
        *self.records.lock().unwrap() = records;
    }
}

#[async_trait]
impl HarvestClient for ScriptedProvider {
    async fn harvest(&self, request: &HarvestRequest) -> recflow_common::Result<HarvestResponse> {
        let request = request.request_string();
        self.requests.lock().unwrap().push(request.clone());
        Ok(HarvestResponse {
            records: self.records.lock().unwrap().clone(),
            request,
        })
    }
}

fn oai_id(n: usize) -> String {
    format!("oai:provider.example:{}", n)
}

fn isbn_for(n: usize) -> Option<String> {
    (n % 5 == 0).then(|| format!("978000000{:04}", (n / 5) % ISBN_GROUPS))
}

/// Every fifth record carries one of seven shared ISBNs; a few carry blank ISBN values
fn harvested(n: usize) -> HarvestedRecord {
    let mut fields = json!({ "245a": [format!("  Title   {} ", n)] });
    if let Some(isbn) = isbn_for(n) {
        fields["020a"] = json!([isbn]);
    } else if n % 5 == 1 && n < 25 {
        fields["020a"] = json!(["   "]);
    }
    HarvestedRecord {
        oai_id: oai_id(n),
        sets: BTreeSet::from(["books".to_string()]),
        deleted: false,
        payload: json!({ "fields": fields }),
    }
}

fn deletion(n: usize) -> HarvestedRecord {
    HarvestedRecord {
        oai_id: oai_id(n),
        sets: BTreeSet::new(),
        deleted: true,
        payload: serde_json::Value::Null,
    }
}

struct Pipeline {
    env: TestEnv,
    provider_repo: Repository,
    norm: ServiceInfo,
    agg: ServiceInfo,
    client: Arc<ScriptedProvider>,
    runner: HarvestRunner,
    schedule_id: i64,
}

async fn pipeline() -> Pipeline {
    let env = test_env(test_config()).await.unwrap();
    let (source, provider_repo) = provider(&env.state, "library").await.unwrap();
    let norm = register_service(&env.state, "Norm", "normalization", "1.0").await.unwrap();
    let agg = register_service(&env.state, "Agg", "aggregation", "1.0").await.unwrap();

    for (from, to) in [
        (DirectiveSource::Provider(source.id), norm.id),
        (DirectiveSource::Service(norm.id), agg.id),
    ] {
        directives::insert_directive(
            &env.state.db,
            &NewDirective {
                source: from,
                target_service_id: to,
                output_set: None,
                formats: vec!["marc21".to_string()],
                sets: vec![],
            },
        )
        .await
        .unwrap();
    }

    let schedule_id = schedules::insert_schedule(&env.state.db, "nightly", source.id)
        .await
        .unwrap();
    schedules::add_step(&env.state.db, schedule_id, "marc21", Some("books"))
        .await
        .unwrap();

    let client = Arc::new(ScriptedProvider::default());
    let runner = HarvestRunner::new(&env.state, client.clone());
    Pipeline {
        env,
        provider_repo,
        norm,
        agg,
        client,
        runner,
        schedule_id,
    }
}

async fn all_records(repo: &Repository) -> Vec<Record> {
    let mut records = Vec::new();
    let mut filter = RecordFilter::default();
    loop {
        let page = repo.get_records(&filter).await.unwrap();
        let Some(last_id) = page.last().and_then(|r| r.id) else {
            return records;
        };
        records.extend(page);
        filter = filter.starting_after(last_id);
    }
}

async fn norm_output_for(p: &Pipeline, n: usize) -> Record {
    let input = p
        .provider_repo
        .get_record_by_oai_id(&oai_id(n))
        .await
        .unwrap()
        .unwrap();
    let norm_repo = p.env.state.engine().repository_for(&p.norm);
    let successor = *p
        .provider_repo
        .get_successor_ids(input.id.unwrap())
        .await
        .unwrap()
        .iter()
        .next()
        .unwrap();
    norm_repo.get_record(successor).await.unwrap().unwrap()
}

async fn reloaded_match_engine(p: &Pipeline) -> MatchEngine {
    let store = MatchPointStore::new(p.env.state.db.clone(), p.agg.name.clone());
    let mut engine = MatchEngine::from_settings(&p.env.state.config.matching, Some(&store)).unwrap();
    engine.load().await.unwrap();
    engine
}

async fn harvest_and_settle(p: &Pipeline, records: Vec<HarvestedRecord>) {
    p.client.respond_with(records);
    p.runner.run_schedule(p.schedule_id).await.unwrap();
    let outcomes = JobScheduler::new(p.env.state.clone())
        .run_until_idle()
        .await
        .unwrap();
    for outcome in &outcomes {
        assert_eq!(outcome.status, ServiceStatus::NotRunning, "{:?}", outcome.failure);
    }
    assert!(p.env.state.queue().is_empty().await.unwrap());
}

#[tokio::test]
async fn test_harvest_flows_through_normalization_and_aggregation() {
    // Given: a provider feeding normalization, which feeds aggregation
    let p = pipeline().await;

    // When: 175 records are harvested and the queue drains
    harvest_and_settle(&p, (0..RECORDS).map(harvested).collect()).await;

    // Then: every record was normalized once
    let norm_repo = p.env.state.engine().repository_for(&p.norm);
    let normalized = all_records(&norm_repo).await;
    assert_eq!(normalized.len(), RECORDS);
    assert_eq!(
        normalized[0].payload["fields"]["245a"],
        json!(["Title 0"])
    );
    for record in &normalized {
        assert_eq!(record.predecessors.len(), 1);
    }

    // And: records sharing an ISBN collapse into one aggregated output each
    let agg_repo = p.env.state.engine().repository_for(&p.agg);
    let aggregated = all_records(&agg_repo).await;
    assert_eq!(aggregated.len(), RECORDS - RECORDS / 5 + ISBN_GROUPS);
    let merged: Vec<&Record> = aggregated.iter().filter(|r| r.predecessors.len() > 1).collect();
    assert_eq!(merged.len(), ISBN_GROUPS);
    assert!(merged.iter().all(|r| r.predecessors.len() == RECORDS / 5 / ISBN_GROUPS));

    let manifestation_ids: BTreeSet<i64> = aggregated
        .iter()
        .filter_map(|r| r.payload["manifestation_id"].as_i64())
        .collect();
    assert_eq!(manifestation_ids.len(), aggregated.len());

    // And: statistics reflect the work done
    let norm_info = services::load_service(&p.env.state.db, p.norm.id).await.unwrap().unwrap();
    assert_eq!(norm_info.output_record_count, RECORDS as i64);
    assert_eq!(norm_info.warnings, 5);
    let agg_info = services::load_service(&p.env.state.db, p.agg.id).await.unwrap().unwrap();
    assert_eq!(agg_info.output_record_count, aggregated.len() as i64);
    assert_eq!(agg_info.status, ServiceStatus::NotRunning);

    // And: the harvest asked for the configured set
    let requests = p.client.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].contains("metadataPrefix=marc21&set=books"));
    assert!(!requests[0].contains("from="));
}

#[tokio::test]
async fn test_isbn_matcher_counts_parsable_records() {
    let p = pipeline().await;
    harvest_and_settle(&p, (0..RECORDS).map(harvested).collect()).await;

    let engine = reloaded_match_engine(&p).await;
    let isbn = engine.matcher("isbn").unwrap();
    let with_isbn = (0..RECORDS).filter(|n| isbn_for(*n).is_some()).count();
    assert_eq!(isbn.num_record_ids().await.unwrap(), with_isbn);
    assert_eq!(isbn.num_match_points().await.unwrap(), ISBN_GROUPS);
}

#[tokio::test]
async fn test_records_sharing_an_isbn_are_mutual_candidates() {
    let p = pipeline().await;
    harvest_and_settle(&p, (0..RECORDS).map(harvested).collect()).await;
    let engine = reloaded_match_engine(&p).await;

    // Records 5 and 40 share ISBN group 1; record 7 has no ISBN
    let first = norm_output_for(&p, 5).await;
    let second = norm_output_for(&p, 40).await;
    let unrelated = norm_output_for(&p, 7).await;
    let first_parsed = ParsedRecord::from_record(&first).unwrap();
    let second_parsed = ParsedRecord::from_record(&second).unwrap();

    let from_first = engine.candidates(&first_parsed).await.unwrap();
    let from_second = engine.candidates(&second_parsed).await.unwrap();
    assert!(from_first.contains(&second.id.unwrap()));
    assert!(from_second.contains(&first.id.unwrap()));
    assert_eq!(from_first.len(), RECORDS / 5 / ISBN_GROUPS - 1);
    assert!(!from_first.contains(&unrelated.id.unwrap()));
    assert!(engine
        .candidates(&ParsedRecord::from_record(&unrelated).unwrap())
        .await
        .unwrap()
        .is_empty());

    // The first record of the group is the link target of the later ones
    let group_head = norm_output_for(&p, 0).await;
    let agg_repo = p.env.state.engine().repository_for(&p.agg);
    let linked = agg_repo.get_linked_record_ids(group_head.id.unwrap()).await.unwrap();
    assert_eq!(linked.len(), RECORDS / 5 / ISBN_GROUPS - 1);
}

#[tokio::test]
async fn test_upstream_deletion_propagates_downstream() {
    // Given: a settled pipeline
    let p = pipeline().await;
    harvest_and_settle(&p, (0..RECORDS).map(harvested).collect()).await;
    let agg_repo = p.env.state.engine().repository_for(&p.agg);
    let before = all_records(&agg_repo).await;
    let lone_output = {
        let norm_3 = norm_output_for(&p, 3).await;
        *agg_repo
            .get_successor_ids(norm_3.id.unwrap())
            .await
            .unwrap()
            .iter()
            .next()
            .unwrap()
    };
    let group_output = {
        let norm_0 = norm_output_for(&p, 0).await;
        *agg_repo
            .get_successor_ids(norm_0.id.unwrap())
            .await
            .unwrap()
            .iter()
            .next()
            .unwrap()
    };

    // When: the provider deletes record 3 (unmatched) and record 0 (one of a group),
    // and reports a deletion for a record it never sent
    harvest_and_settle(&p, vec![deletion(3), deletion(0), deletion(9999)]).await;

    // Then: the provider and normalization tombstones exist
    assert!(p
        .provider_repo
        .get_record_by_oai_id(&oai_id(3))
        .await
        .unwrap()
        .unwrap()
        .is_deleted());
    assert!(norm_output_for(&p, 3).await.is_deleted());
    assert!(norm_output_for(&p, 0).await.is_deleted());

    // And: the unmatched aggregate is retracted, the merged one survives its member
    let lone = agg_repo.get_record(lone_output).await.unwrap().unwrap();
    assert!(lone.is_deleted());
    let group = agg_repo.get_record(group_output).await.unwrap().unwrap();
    assert!(!group.is_deleted());
    assert_eq!(group.predecessors.len(), RECORDS / 5 / ISBN_GROUPS - 1);

    let after = all_records(&agg_repo).await;
    assert_eq!(after.len(), before.len());
    assert_eq!(after.iter().filter(|r| r.is_deleted()).count(), 1);

    // And: the deleted group member left the ISBN matcher
    let engine = reloaded_match_engine(&p).await;
    let with_isbn = (0..RECORDS).filter(|n| isbn_for(*n).is_some()).count();
    assert_eq!(
        engine.matcher("isbn").unwrap().num_record_ids().await.unwrap(),
        with_isbn - 1
    );

    // And: the second harvest was incremental
    let requests = p.client.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].contains("from="));
}

#[tokio::test]
async fn test_updated_record_links_new_matches_and_refreshes_its_output() {
    // Given: a settled pipeline where record 7 has no ISBN and an aggregate of its own
    let p = pipeline().await;
    harvest_and_settle(&p, (0..RECORDS).map(harvested).collect()).await;
    let agg_repo = p.env.state.engine().repository_for(&p.agg);
    let norm_7 = norm_output_for(&p, 7).await.id.unwrap();
    let lone_output = *agg_repo.get_successor_ids(norm_7).await.unwrap().iter().next().unwrap();
    let before = agg_repo.get_record(lone_output).await.unwrap().unwrap();

    // When: the provider revises record 7 with a new title and the ISBN of group 1
    let mut revised = harvested(7);
    revised.payload = json!({ "fields": {
        "245a": ["Title 7 revised"],
        "020a": [isbn_for(5).unwrap()],
    }});
    harvest_and_settle(&p, vec![revised]).await;

    // Then: the updated record is linked to every member of its new group
    let group: Vec<usize> = (0..RECORDS).filter(|n| isbn_for(*n) == isbn_for(5)).collect();
    for n in group {
        let member = norm_output_for(&p, n).await.id.unwrap();
        let linked = agg_repo.get_linked_record_ids(member).await.unwrap();
        assert!(linked.contains(&norm_7), "record {} not linked", n);
    }

    // And: its aggregate carries the new payload under the same manifestation id
    assert_eq!(agg_repo.get_successor_ids(norm_7).await.unwrap(), BTreeSet::from([lone_output]));
    let after = agg_repo.get_record(lone_output).await.unwrap().unwrap();
    assert_eq!(after.payload["fields"]["245a"], json!(["Title 7 revised"]));
    assert_eq!(after.payload["manifestation_id"], before.payload["manifestation_id"]);
    assert_eq!(after.predecessors, BTreeSet::from([norm_7]));
}
