//! Mail flows through the service, on both backends

use postbox::boxes::BoxKey;
use postbox::collaborators::{MemoryPermissions, MemoryPresence, RecordingNotifier};
use postbox::config::{BackendKind, PostboxConfig};
use postbox::escrow::{Economy, EscrowError, Inventory, MemoryEconomy, MemoryInventory};
use postbox::model::{Actor, ItemStack, MailLimits, Price};
use postbox::store::{FileMailStore, MailStore, OpenedStore};
use postbox::{MailError, MailService, MailServiceBuilder};
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    service: MailService,
    presence: Arc<MemoryPresence>,
    permissions: Arc<MemoryPermissions>,
    notifier: Arc<RecordingNotifier>,
}

fn harness_with(
    backend: BackendKind,
    configure: impl FnOnce(&mut PostboxConfig),
    extend: impl FnOnce(MailServiceBuilder) -> MailServiceBuilder,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = PostboxConfig::new()
        .with_data_dir(dir.path())
        .with_backend(backend);
    configure(&mut config);

    let presence = Arc::new(MemoryPresence::new());
    let permissions = Arc::new(MemoryPermissions::new());
    let notifier = Arc::new(RecordingNotifier::new());

    let mut builder = MailService::builder(config)
        .presence(presence.clone())
        .permissions(permissions.clone())
        .notifier(notifier.clone());
    if backend == BackendKind::Files {
        let files = FileMailStore::open_loaded(dir.path(), MailLimits::default()).unwrap();
        builder = builder.store(OpenedStore::Files(Arc::new(files)));
    }

    Harness {
        service: extend(builder).build().unwrap(),
        _dir: dir,
        presence,
        permissions,
        notifier,
    }
}

fn harness(backend: BackendKind) -> Harness {
    harness_with(backend, |_| {}, |b| b)
}

const BACKENDS: [BackendKind; 2] = [BackendKind::Files, BackendKind::Sqlite];

fn attach(service: &MailService, sender: &Actor, stacks: &[ItemStack]) {
    let draft_box = service.open_draft_box(sender).unwrap();
    {
        let mut open = draft_box.lock().unwrap();
        for stack in stacks {
            open.add(stack.clone()).unwrap();
        }
    }
    service
        .close_box(sender, &BoxKey::Draft(sender.clone()))
        .unwrap();
}

#[test]
fn test_plain_mail_reaches_inbox_and_outbox() {
    for backend in BACKENDS {
        let h = harness(backend);
        let a = Actor::dummy("Alice");
        let b = Actor::dummy("Bob");
        h.presence.connect(&b);

        h.service.add_recipient(&a, b.clone()).unwrap();
        h.service.push_line(&a, "hi").unwrap();
        let sent = h.service.send(&a, None).unwrap();

        let inbox = h.service.inbox(&b).unwrap();
        assert_eq!(inbox.len(), 1, "{}", backend);
        assert_eq!(inbox[0].id(), sent.id());
        assert_eq!(inbox[0].body(), &["hi".to_string()]);
        assert_eq!(h.service.unread(&b).unwrap().len(), 1);

        let outbox = h.service.outbox(&a).unwrap();
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].id(), sent.id());
        assert_eq!(h.notifier.notifications(), vec![(b.clone(), sent.id())]);

        h.service.read(&b, sent.id()).unwrap();
        assert!(h.service.unread(&b).unwrap().is_empty());
        h.service.trash(&b, sent.id()).unwrap();
        assert!(h.service.inbox(&b).unwrap().is_empty());
        assert_eq!(h.service.trashbox(&b).unwrap().len(), 1);
        h.service.restore(&b, sent.id()).unwrap();
        assert_eq!(h.service.inbox(&b).unwrap().len(), 1);
    }
}

#[test]
fn test_outsiders_cannot_see_mail() {
    let h = harness(BackendKind::Sqlite);
    let a = Actor::dummy("Alice");
    let b = Actor::dummy("Bob");
    let eve = Actor::dummy("Eve");

    h.service.add_recipient(&a, b.clone()).unwrap();
    let sent = h.service.send(&a, None).unwrap();

    assert!(matches!(
        h.service.get(&eve, sent.id()),
        Err(MailError::NotFound(_))
    ));
    h.permissions.grant_operator(&eve);
    assert!(h.service.get(&eve, sent.id()).is_ok());
}

#[test]
fn test_attachments_to_many_need_capability() {
    for backend in BACKENDS {
        let h = harness(backend);
        let a = Actor::dummy("Alice");
        for name in ["Bob", "Carol", "Dave"] {
            h.service.add_recipient(&a, Actor::dummy(name)).unwrap();
        }
        attach(&h.service, &a, &[ItemStack::new("stone", 3)]);

        let err = h.service.send(&a, None).unwrap_err();
        assert!(matches!(err, MailError::PermissionDenied(_)), "{}", backend);
        assert!(h.service.outbox(&a).unwrap().is_empty());
        assert!(h.service.store().draft(&a).unwrap().is_some());
    }
}

#[test]
fn test_group_recipients_frozen_at_send() {
    for backend in BACKENDS {
        let h = harness(backend);
        let owner = Actor::dummy("Alice");
        let b = Actor::dummy("Bob");
        let c = Actor::dummy("Carol");

        h.service.create_group(&owner, "Guild").unwrap();
        h.service.add_group_member(&owner, "Guild", b.clone()).unwrap();
        h.service.add_group_member(&owner, "Guild", c.clone()).unwrap();

        h.service.add_group(&owner, "Guild").unwrap();
        h.service.push_line(&owner, "meeting tonight").unwrap();
        let sent = h.service.send(&owner, None).unwrap();
        assert_eq!(
            sent.total_recipients().unwrap(),
            &BTreeSet::from([b.clone(), c.clone()])
        );

        h.service.remove_group_member(&owner, "Guild", &c).unwrap();
        let reloaded = h.service.get(&c, sent.id()).unwrap();
        assert!(reloaded.total_recipients().unwrap().contains(&c));
        assert_eq!(h.service.inbox(&c).unwrap().len(), 1, "{}", backend);

        // A deleted group no longer matters to mail already sent
        h.service.delete_group(&owner, "Guild").unwrap();
        assert_eq!(h.service.inbox(&b).unwrap().len(), 1);
    }
}

#[test]
fn test_dynamic_group_needs_operator() {
    for backend in BACKENDS {
        let h = harness(backend);
        let op = Actor::dummy("Op");
        let b = Actor::dummy("Bob");
        h.presence.connect(&b);

        assert!(matches!(
            h.service.add_group(&op, "All-Connected"),
            Err(MailError::PermissionDenied(_))
        ));
        h.permissions.grant_operator(&op);
        h.service.add_group(&op, "All-Connected").unwrap();
        let sent = h.service.send(&op, None).unwrap();
        assert!(sent.total_recipients().unwrap().contains(&b), "{}", backend);
    }
}

/// Send a one-line mail from an operator to a single dynamic group
fn send_to_dynamic(h: &Harness, op: &Actor, group: &str) -> BTreeSet<Actor> {
    h.service.add_group(op, group).unwrap();
    h.service.push_line(op, group).unwrap();
    let sent = h.service.send(op, None).unwrap();
    assert_eq!(h.service.outbox(op).unwrap()[0].id(), sent.id());
    sent.total_recipients().unwrap().clone()
}

#[test]
fn test_dynamic_groups_expand_alike_on_both_backends() {
    let op = Actor::dummy("Op");
    let owner = Actor::dummy("Alice");
    let member = Actor::dummy("Bob");
    let online = Actor::dummy("Carol");
    let returning = Actor::dummy("Dave");
    let vip = Actor::dummy("Eve");

    let mut per_backend = Vec::new();
    for backend in BACKENDS {
        let h = harness(backend);
        h.permissions.grant_operator(&op);
        h.permissions.add_to_group("vip", &vip);
        h.presence.connect(&online);
        h.presence.remember(&returning);

        // Group owners and members are known only through the group
        h.service.create_group(&owner, "Guild").unwrap();
        h.service
            .add_group_member(&owner, "Guild", member.clone())
            .unwrap();

        let everyone = send_to_dynamic(&h, &op, "All");
        for actor in [&owner, &member, &online, &returning] {
            assert!(everyone.contains(actor), "{}: All lacks {}", backend, actor);
        }

        let connected = send_to_dynamic(&h, &op, "all-connected");
        assert_eq!(connected, BTreeSet::from([online.clone()]), "{}", backend);

        let ever = send_to_dynamic(&h, &op, "All-Ever-Logged-In");
        assert_eq!(
            ever,
            BTreeSet::from([online.clone(), returning.clone()]),
            "{}",
            backend
        );

        let permitted = send_to_dynamic(&h, &op, "External-permission-group:vip");
        assert_eq!(permitted, BTreeSet::from([vip.clone()]), "{}", backend);
        assert_eq!(h.service.inbox(&vip).unwrap().len(), 1);

        per_backend.push((everyone, connected, ever, permitted));
    }
    assert_eq!(per_backend[0], per_backend[1]);
}

#[test]
fn test_refuse_returns_items_to_sender() {
    for backend in BACKENDS {
        let h = harness(backend);
        let a = Actor::dummy("Alice");
        let b = Actor::dummy("Bob");

        h.service.add_recipient(&a, b.clone()).unwrap();
        attach(&h.service, &a, &[ItemStack::new("diamond", 2)]);
        h.service.set_price(&a, Price::Money(50)).unwrap();
        let sent = h.service.send(&a, None).unwrap();

        let refused = h
            .service
            .refuse_attachments(&b, sent.id(), Some("no thanks".to_string()))
            .unwrap();
        assert!(refused.attachments_refused());
        assert!(refused.attachments().is_empty());
        assert_eq!(refused.price(), &Price::Free);

        let returned = h.service.inbox(&a).unwrap();
        assert_eq!(returned.len(), 1, "{}", backend);
        assert_eq!(returned[0].attachments(), &[ItemStack::new("diamond", 2)]);
        assert!(returned[0].body().iter().any(|l| l.contains("no thanks")));

        // Cancelling after a refusal is rejected
        assert!(h.service.cancel_attachments(&a, sent.id()).is_err());
    }
}

#[test]
fn test_cancel_lets_sender_take_items_back() {
    let h = harness(BackendKind::Sqlite);
    let a = Actor::dummy("Alice");
    let b = Actor::dummy("Bob");

    h.service.add_recipient(&a, b.clone()).unwrap();
    attach(&h.service, &a, &[ItemStack::new("emerald", 5)]);
    let sent = h.service.send(&a, None).unwrap();

    assert!(matches!(
        h.service.cancel_attachments(&b, sent.id()),
        Err(MailError::Escrow(EscrowError::NotSender(_)))
    ));
    h.service.cancel_attachments(&a, sent.id()).unwrap();

    // The recipient can no longer open them
    assert!(h.service.open_attachments(&b, sent.id()).is_err());

    let shared = h.service.open_attachments(&a, sent.id()).unwrap();
    let taken = shared.lock().unwrap().take_all();
    assert_eq!(taken, vec![ItemStack::new("emerald", 5)]);
    let closed = h
        .service
        .close_box(&a, &BoxKey::Mail(sent.id()))
        .unwrap();
    assert!(closed.attachments().is_empty());
    assert_eq!(closed.attachments_original(), &[ItemStack::new("emerald", 5)]);
}

#[test]
fn test_money_price_paid_once() {
    let economy = Arc::new(MemoryEconomy::new());
    let h = harness_with(BackendKind::Sqlite, |_| {}, |b| b.economy(economy.clone()));
    let a = Actor::dummy("Alice");
    let b = Actor::dummy("Bob");
    economy.set_balance(&a, 100);
    economy.set_balance(&b, 40);

    h.service.add_recipient(&a, b.clone()).unwrap();
    attach(&h.service, &a, &[ItemStack::new("map", 1)]);
    h.service.set_price(&a, Price::Money(25)).unwrap();
    let sent = h.service.send(&a, None).unwrap();

    assert!(matches!(
        h.service.open_attachments(&b, sent.id()),
        Err(MailError::Escrow(EscrowError::PaymentDue(_)))
    ));
    h.service.confirm_payment(&b, sent.id()).unwrap();
    assert_eq!(economy.balance(&a), 125);
    assert_eq!(economy.balance(&b), 15);

    h.service
        .close_box(&b, &BoxKey::Mail(sent.id()))
        .unwrap();
    // Opening again is free
    h.service.open_attachments(&b, sent.id()).unwrap();
    assert_eq!(economy.balance(&b), 15);
}

#[test]
fn test_capped_deposit_rolls_back() {
    let economy = Arc::new(MemoryEconomy::new().with_deposit_cap(100));
    let h = harness_with(BackendKind::Sqlite, |_| {}, |b| b.economy(economy.clone()));
    let a = Actor::dummy("Alice");
    let b = Actor::dummy("Bob");
    economy.set_balance(&a, 90);
    economy.set_balance(&b, 50);

    h.service.add_recipient(&a, b.clone()).unwrap();
    attach(&h.service, &a, &[ItemStack::new("map", 1)]);
    h.service.set_price(&a, Price::Money(25)).unwrap();
    let sent = h.service.send(&a, None).unwrap();

    let err = h.service.confirm_payment(&b, sent.id()).unwrap_err();
    assert!(matches!(
        err,
        MailError::Escrow(EscrowError::DepositMismatch {
            expected: 115,
            actual: 100
        })
    ));
    assert_eq!(economy.balance(&a), 90);
    assert_eq!(economy.balance(&b), 50);

    let mail = h.service.get(&b, sent.id()).unwrap();
    assert!(!mail.attachments_opened());
    assert_eq!(mail.price(), &Price::Money(25));
}

#[test]
fn test_item_price_sends_payment_mail() {
    let inventory = Arc::new(MemoryInventory::new());
    let h = harness_with(
        BackendKind::Files,
        |_| {},
        |b| b.inventory(inventory.clone()),
    );
    let a = Actor::dummy("Alice");
    let b = Actor::dummy("Bob");
    inventory.give(&b, &ItemStack::new("gold", 10));

    h.service.add_recipient(&a, b.clone()).unwrap();
    attach(&h.service, &a, &[ItemStack::new("sword", 1)]);
    h.service
        .set_price(&a, Price::Item(ItemStack::new("gold", 4)))
        .unwrap();
    let sent = h.service.send(&a, None).unwrap();

    h.service.confirm_payment(&b, sent.id()).unwrap();
    assert_eq!(inventory.count(&b, "gold"), 6);

    let payments = h.service.inbox(&a).unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].sender(), &b);
    assert_eq!(payments[0].attachments(), &[ItemStack::new("gold", 4)]);
}

#[test]
fn test_box_contents_are_compacted() {
    for backend in BACKENDS {
        let h = harness(backend);
        let a = Actor::dummy("Alice");
        let b = Actor::dummy("Bob");

        h.service.add_recipient(&a, b.clone()).unwrap();
        attach(
            &h.service,
            &a,
            &[
                ItemStack::new("stone", 40),
                ItemStack::new("dirt", 1),
                ItemStack::new("stone", 40),
            ],
        );
        let draft = h.service.store().draft(&a).unwrap().unwrap();
        assert_eq!(
            draft.attachments(),
            &[
                ItemStack::new("stone", 64),
                ItemStack::new("stone", 16),
                ItemStack::new("dirt", 1),
            ],
            "{}",
            backend
        );

        let sent = h.service.send(&a, None).unwrap();
        let shared = h.service.open_attachments(&b, sent.id()).unwrap();
        {
            let mut open = shared.lock().unwrap();
            assert_eq!(open.item_count(), 81);
            open.take(0);
        }
        let closed = h
            .service
            .close_box(&b, &BoxKey::Mail(sent.id()))
            .unwrap();
        assert_eq!(
            closed.attachments(),
            &[ItemStack::new("stone", 16), ItemStack::new("dirt", 1)]
        );
        assert!(closed.attachments_opened());
    }
}

#[test]
fn test_shutdown_keeps_open_draft_box() {
    let dir = TempDir::new().unwrap();
    let a = Actor::dummy("Alice");
    {
        let config = PostboxConfig::new().with_data_dir(dir.path());
        let files = FileMailStore::open_loaded(dir.path(), MailLimits::default()).unwrap();
        let service = MailService::builder(config)
            .store(OpenedStore::Files(Arc::new(files)))
            .build()
            .unwrap();
        let draft_box = service.open_draft_box(&a).unwrap();
        draft_box
            .lock()
            .unwrap()
            .add(ItemStack::new("apple", 3))
            .unwrap();
        service.shutdown().unwrap();
    }

    let store = FileMailStore::open_loaded(dir.path(), MailLimits::default()).unwrap();
    let draft = store.draft(&a).unwrap().unwrap();
    assert_eq!(draft.attachments(), &[ItemStack::new("apple", 3)]);
}
