mod common;

use common::{repository, seed_articles, store, stored, Article, ArticleField};
use stowage_core::{Cancellation, FieldSelection, IdentityKey, TrackingMode, TrackingState, Value};

fn key_of(article: &Article) -> IdentityKey {
    IdentityKey::from(Value::Text(article.id.clone()))
}

#[tokio::test]
async fn delete_marks_the_tracked_instance_not_the_caller_copy() {
    let store = store().await;
    let seeded = seed_articles(&store, 1).await;
    let mut repo = repository::<Article>(&store).await;
    let cancel = Cancellation::new();

    let query = repo.query(TrackingMode::Tracking);
    repo.fetch(query, &cancel).await.unwrap();
    let attaches_after_load = repo.stats().attaches;

    let stranger = Article {
        title: "same key, other instance".to_string(),
        ..seeded[0].clone()
    };
    repo.delete(&stranger, false, &cancel).await.unwrap();

    assert_eq!(repo.state_of(&seeded[0]).unwrap(), TrackingState::PendingDelete);
    let tracked = repo.tracked(&key_of(&seeded[0])).unwrap().unwrap();
    assert_eq!(tracked.title, seeded[0].title);
    assert_eq!(repo.stats().attaches, attaches_after_load);

    repo.save(&cancel).await.unwrap();
    assert!(repo.find(&key_of(&seeded[0]), &cancel).await.unwrap().is_none());
    assert!(stored::<Article>(&store).await.is_empty());
}

#[tokio::test]
async fn delete_of_untracked_record_attaches_it() {
    let store = store().await;
    let seeded = seed_articles(&store, 1).await;
    let mut repo = repository::<Article>(&store).await;

    repo.delete(&seeded[0], true, &Cancellation::new())
        .await
        .unwrap();

    let stats = repo.stats();
    assert_eq!((stats.attaches, stats.removes), (1, 1));
    assert_eq!(repo.state_of(&seeded[0]).unwrap(), TrackingState::Untracked);
    assert!(stored::<Article>(&store).await.is_empty());
}

#[tokio::test]
async fn small_batch_delete_reconciles_like_single_delete() {
    let store = store().await;
    let seeded = seed_articles(&store, 3).await;
    let mut repo = repository::<Article>(&store).await;
    let cancel = Cancellation::new();

    let query = repo.query(TrackingMode::Tracking);
    repo.fetch(query, &cancel).await.unwrap();
    let copies: Vec<Article> = seeded.iter().take(2).cloned().collect();

    repo.delete_batch(&copies, false, false, &cancel)
        .await
        .unwrap();

    assert_eq!(repo.stats().attaches, 3);
    assert_eq!(repo.state_of(&seeded[0]).unwrap(), TrackingState::PendingDelete);
    assert_eq!(repo.state_of(&seeded[1]).unwrap(), TrackingState::PendingDelete);
    assert_eq!(repo.state_of(&seeded[2]).unwrap(), TrackingState::Active);

    repo.save(&cancel).await.unwrap();
    assert_eq!(stored::<Article>(&store).await, vec![seeded[2].clone()]);
}

#[tokio::test]
async fn partial_update_never_clobbers_other_fields() {
    let store = store().await;
    let seeded = seed_articles(&store, 2).await;
    let cancel = Cancellation::new();

    // Tracked path: the session already holds the instance.
    let mut tracked_repo = repository::<Article>(&store).await;
    let query = tracked_repo.query(TrackingMode::Tracking);
    tracked_repo.fetch(query, &cancel).await.unwrap();
    let incoming = Article {
        title: "retitled".to_string(),
        body: "stale body".to_string(),
        views: 77,
        ..seeded[0].clone()
    };
    tracked_repo
        .update(&incoming, true, &FieldSelection::only([ArticleField::Title]), &cancel)
        .await
        .unwrap();
    let tracked = tracked_repo.tracked(&key_of(&seeded[0])).unwrap().unwrap();
    assert_eq!(tracked.body, seeded[0].body);

    // Untracked path: a fresh session attaches the incoming value.
    let mut fresh_repo = repository::<Article>(&store).await;
    let incoming = Article {
        views: 5,
        body: "stale body".to_string(),
        ..seeded[1].clone()
    };
    fresh_repo
        .update(&incoming, true, &FieldSelection::only([ArticleField::Views]), &cancel)
        .await
        .unwrap();

    let rows = stored::<Article>(&store).await;
    let first = rows.iter().find(|row| row.id == seeded[0].id).unwrap();
    let second = rows.iter().find(|row| row.id == seeded[1].id).unwrap();
    assert_eq!(
        (first.title.as_str(), first.body.as_str(), first.views),
        ("retitled", seeded[0].body.as_str(), 0)
    );
    assert_eq!(
        (second.title.as_str(), second.body.as_str(), second.views),
        (seeded[1].title.as_str(), seeded[1].body.as_str(), 5)
    );
}

#[tokio::test]
async fn full_update_copies_values_onto_tracked_instance() {
    let store = store().await;
    let seeded = seed_articles(&store, 1).await;
    let mut repo = repository::<Article>(&store).await;
    let cancel = Cancellation::new();

    let query = repo.query(TrackingMode::Tracking);
    repo.fetch(query, &cancel).await.unwrap();
    let replacement = Article {
        title: "replaced".to_string(),
        body: "replaced body".to_string(),
        views: 3,
        ..seeded[0].clone()
    };
    repo.update(&replacement, false, &FieldSelection::all(), &cancel)
        .await
        .unwrap();

    assert_eq!(repo.state_of(&seeded[0]).unwrap(), TrackingState::Dirty);
    assert_eq!(repo.tracked(&key_of(&seeded[0])).unwrap().unwrap(), &replacement);
    assert_eq!(repo.stats().attaches, 1);

    repo.save(&cancel).await.unwrap();
    assert_eq!(stored::<Article>(&store).await, vec![replacement]);
}

#[tokio::test]
async fn deleting_a_pending_insert_only_detaches_it() {
    let store = store().await;
    let mut repo = repository::<Article>(&store).await;
    let cancel = Cancellation::new();

    let article = repo
        .insert(Article::new("never stored", "body"), false, &cancel)
        .await
        .unwrap();
    repo.delete(&article, false, &cancel).await.unwrap();

    assert_eq!(repo.state_of(&article).unwrap(), TrackingState::Untracked);
    assert_eq!(repo.save(&cancel).await.unwrap(), 0);
    assert!(stored::<Article>(&store).await.is_empty());
}

#[tokio::test]
async fn update_after_delete_revives_the_entry() {
    let store = store().await;
    let seeded = seed_articles(&store, 1).await;
    let mut repo = repository::<Article>(&store).await;
    let cancel = Cancellation::new();

    repo.delete(&seeded[0], false, &cancel).await.unwrap();
    assert_eq!(repo.state_of(&seeded[0]).unwrap(), TrackingState::PendingDelete);

    let revived = Article {
        views: 1,
        ..seeded[0].clone()
    };
    repo.update(&revived, true, &FieldSelection::only(["views"]), &cancel)
        .await
        .unwrap();

    assert_eq!(repo.state_of(&seeded[0]).unwrap(), TrackingState::Active);
    assert_eq!(stored::<Article>(&store).await, vec![revived]);
}

#[tokio::test]
async fn tracked_query_returns_the_identity_map_copy() {
    let store = store().await;
    let seeded = seed_articles(&store, 1).await;
    let mut repo = repository::<Article>(&store).await;
    let cancel = Cancellation::new();

    let query = repo.query(TrackingMode::Tracking);
    repo.fetch(query, &cancel).await.unwrap();
    repo.tracked_mut(&key_of(&seeded[0])).unwrap().unwrap().views = 11;

    let query = repo.query(TrackingMode::Tracking);
    let tracked = repo.fetch(query, &cancel).await.unwrap();
    assert_eq!(tracked[0].views, 11);

    let query = repo.query(TrackingMode::NoTracking);
    let detached = repo.fetch(query, &cancel).await.unwrap();
    assert_eq!(detached[0].views, 0);
    assert_eq!(repo.stats().attaches, 1);
}
