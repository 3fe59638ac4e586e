// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use dmcat::{
    messages::{
        AbortBlobTxMsg, CommitBlobTxMsg, CommitBlobTxRspMsg, CtrlDmtCommit, CtrlNotifyDmtUpdate,
        DeleteBlobMsg, ObjectListEntry, QueryCatalogMsg, QueryCatalogRspMsg, SetBlobMetaDataMsg,
        StartBlobTxMsg, UpdateCatalogMsg,
    },
    network::Req,
    DataManager, DmConfig, Dmt, DmtVersion, Error, ObjectId, ReplicaState, SequenceId, ServiceId,
    TxId, VolumeCatalogStore, VolumeDesc, VolumeId,
};

use async_std::task;
use duplexify::Duplex;
use sluice::pipe::{pipe, PipeReader, PipeWriter};
use std::time::Duration;
use tracing::info;

const UNIT: u32 = 4096;
const VOL: VolumeId = VolumeId(7);
const DM1: ServiceId = ServiceId(1);
const DM2: ServiceId = ServiceId(2);
const DM3: ServiceId = ServiceId(3);

fn desc() -> VolumeDesc {
    VolumeDesc::new(VOL, "vol7", UNIT)
}

fn mk_dm(i: u64, cfg: &DmConfig) -> DataManager {
    let catalog = VolumeCatalogStore::in_memory(cfg.clone()).unwrap();
    DataManager::new(ServiceId(i), catalog)
}

type PipeRw = Duplex<PipeReader, PipeWriter>;
fn duplex_pair() -> (PipeRw, PipeRw) {
    let (a_recv, b_send) = pipe();
    let (b_recv, a_send) = pipe();
    let a_end = Duplex::new(a_recv, a_send);
    let b_end = Duplex::new(b_recv, b_send);
    (a_end, b_end)
}

async fn connect_dms(a: &DataManager, b: &DataManager) {
    let (a_end, b_end) = duplex_pair();
    a.connect(b.self_id, a_end).await;
    b.connect(a.self_id, b_end).await;
}

async fn mk_mesh(cfg: DmConfig) -> (DataManager, DataManager, DataManager) {
    let dm_1 = mk_dm(1, &cfg);
    let dm_2 = mk_dm(2, &cfg);
    let dm_3 = mk_dm(3, &cfg);

    connect_dms(&dm_1, &dm_2).await;
    connect_dms(&dm_2, &dm_3).await;
    connect_dms(&dm_1, &dm_3).await;

    dm_1.launch_workers().await;
    dm_2.launch_workers().await;
    dm_3.launch_workers().await;
    (dm_1, dm_2, dm_3)
}

fn setup_tracing_subscriber() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn oid(n: u64) -> ObjectId {
    ObjectId::from_u64(n)
}

fn entry(offset: u64, size: u32, n: u64) -> ObjectListEntry {
    ObjectListEntry {
        offset,
        size,
        object_id: oid(n),
    }
}

// An access-layer client, talking to `coord` through the DM `via`.
struct Client<'a> {
    via: &'a DataManager,
    coord: ServiceId,
    dmt: DmtVersion,
}

impl<'a> Client<'a> {
    async fn start(&self, tx: u64, name: &str) -> Result<(), Error> {
        self.via
            .request(
                self.coord,
                Req::StartBlobTx(StartBlobTxMsg {
                    volume_id: VOL,
                    blob_name: name.to_string(),
                    blob_version: 0,
                    blob_mode: 0,
                    tx_id: TxId(tx),
                    dmt_version: self.dmt,
                }),
            )
            .await?
            .into_ack()
    }

    async fn update(
        &self,
        tx: u64,
        name: &str,
        object_list: Vec<ObjectListEntry>,
        payloads: Vec<(ObjectId, Vec<u8>)>,
    ) -> Result<(), Error> {
        self.via
            .request(
                self.coord,
                Req::UpdateCatalog(UpdateCatalogMsg {
                    volume_id: VOL,
                    blob_name: name.to_string(),
                    tx_id: TxId(tx),
                    object_list,
                    payloads,
                }),
            )
            .await?
            .into_ack()
    }

    async fn commit(&self, tx: u64, name: &str) -> Result<CommitBlobTxRspMsg, Error> {
        self.via
            .request(
                self.coord,
                Req::CommitBlobTx(CommitBlobTxMsg {
                    volume_id: VOL,
                    blob_name: name.to_string(),
                    blob_version: 0,
                    dmt_version: self.dmt,
                    sequence_id: SequenceId(tx),
                    tx_id: TxId(tx),
                }),
            )
            .await?
            .into_commit()
    }

    async fn put(
        &self,
        tx: u64,
        name: &str,
        object_list: Vec<ObjectListEntry>,
    ) -> Result<CommitBlobTxRspMsg, Error> {
        self.start(tx, name).await?;
        self.update(tx, name, object_list, Vec::new()).await?;
        self.commit(tx, name).await
    }

    async fn query(&self, name: &str) -> Result<QueryCatalogRspMsg, Error> {
        self.via
            .request(
                self.coord,
                Req::QueryCatalog(QueryCatalogMsg {
                    volume_id: VOL,
                    blob_name: name.to_string(),
                    start_offset: 0,
                    length: 0,
                }),
            )
            .await?
            .into_query()
    }
}

async fn wait_for_rejoin(coord: &DataManager, replica: ServiceId) {
    for _ in 0..500 {
        let group = coord.group(VOL).await.unwrap();
        if group.replica_state(replica).await == Some(ReplicaState::Functional) {
            return;
        }
        task::sleep(Duration::from_millis(10)).await;
    }
    panic!("{:?} never rejoined the group of {:?}", replica, VOL);
}

async fn applied_commit(dm: &DataManager) -> Option<u64> {
    dm.replica_watermarks(VOL).await.map(|(_, commit)| commit)
}

pub fn replicated_commit_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let (dm_1, dm_2, dm_3) = mk_mesh(DmConfig::default()).await;
        let version = dm_1
            .open_volume_group(desc(), vec![DM1, DM2, DM3])
            .await
            .unwrap();
        assert_eq!(version, 1);

        let client = Client {
            via: &dm_2,
            coord: DM1,
            dmt: DmtVersion(0),
        };
        let payload = vec![0xab; 100];
        client.start(1, "a").await.unwrap();
        client
            .update(
                1,
                "a",
                vec![entry(0, UNIT, 1), entry(u64::from(UNIT), 100, 2)],
                vec![(oid(2), payload.clone())],
            )
            .await
            .unwrap();
        dm_2.request(
            DM1,
            Req::SetBlobMetaData(SetBlobMetaDataMsg {
                volume_id: VOL,
                blob_name: "a".to_string(),
                tx_id: TxId(1),
                meta_data_list: vec![("k".to_string(), "v".to_string())],
            }),
        )
        .await
        .unwrap()
        .into_ack()
        .unwrap();
        let rsp = client.commit(1, "a").await.unwrap();
        info!("committed {:?}", rsp);
        assert_eq!(rsp.blob_version, 1);
        assert_eq!(rsp.byte_count, u64::from(UNIT) + 100);
        assert_eq!(rsp.meta_data_list, vec![("k".to_string(), "v".to_string())]);

        // Start, update, set-meta and commit are ops 1 to 4.
        for dm in [&dm_1, &dm_2, &dm_3].iter() {
            assert_eq!(dm.replica_watermarks(VOL).await, Some((4, 1)));
            let meta = dm.catalog().get_blob_desc(VOL, "a").unwrap();
            assert_eq!(meta.version, 1);
            assert_eq!(meta.size, u64::from(UNIT) + 100);
            assert_eq!(meta.meta.get("k").map(String::as_str), Some("v"));
            assert_eq!(dm.txmgr().len().await, 0);
            assert_eq!(dm.cached_object(&oid(2)).await, Some(payload.clone()));
        }

        let q = client.query("a").await.unwrap();
        assert_eq!(q.blob_version, 1);
        assert_eq!(
            q.object_list,
            vec![entry(0, UNIT, 1), entry(u64::from(UNIT), 100, 2)]
        );

        // Committing twice commits once.
        assert_eq!(client.commit(1, "a").await, Err(Error::NotFound));

        // An aborted transaction leaves nothing behind anywhere.
        client.start(2, "b").await.unwrap();
        client
            .update(2, "b", vec![entry(0, UNIT, 3)], Vec::new())
            .await
            .unwrap();
        dm_2.request(
            DM1,
            Req::AbortBlobTx(AbortBlobTxMsg {
                volume_id: VOL,
                blob_name: "b".to_string(),
                blob_version: 0,
                tx_id: TxId(2),
            }),
        )
        .await
        .unwrap()
        .into_ack()
        .unwrap();
        assert_eq!(client.commit(2, "b").await, Err(Error::NotFound));
        assert_eq!(client.query("b").await, Err(Error::CatEntryNotFound));
        for dm in [&dm_1, &dm_2, &dm_3].iter() {
            assert_eq!(dm.txmgr().len().await, 0);
            assert_eq!(applied_commit(dm).await, Some(1));
        }

        client.start(3, "a").await.unwrap();
        dm_2.request(
            DM1,
            Req::DeleteBlob(DeleteBlobMsg {
                volume_id: VOL,
                blob_name: "a".to_string(),
                tx_id: TxId(3),
            }),
        )
        .await
        .unwrap()
        .into_ack()
        .unwrap();
        let rsp = client.commit(3, "a").await.unwrap();
        assert_eq!(rsp.blob_version, 2);
        assert_eq!(rsp.byte_count, 0);
        assert_eq!(client.query("a").await, Err(Error::CatEntryNotFound));
        for dm in [&dm_1, &dm_2, &dm_3].iter() {
            assert_eq!(applied_commit(dm).await, Some(2));
            assert_eq!(
                dm.catalog().get_blob_desc(VOL, "a"),
                Err(Error::CatEntryNotFound)
            );
        }
    });
}

async fn lagging_replica_rejoins(cfg: DmConfig, commits: u64) {
    let (dm_1, dm_2, dm_3) = mk_mesh(cfg).await;
    dm_1.open_volume_group(desc(), vec![DM1, DM2]).await.unwrap();
    let client = Client {
        via: &dm_2,
        coord: DM1,
        dmt: DmtVersion(0),
    };
    for tx in 1..=commits {
        let name = format!("blob-{}", tx);
        client
            .put(tx, &name, vec![entry(0, UNIT, tx)])
            .await
            .unwrap();
    }
    assert_eq!(applied_commit(&dm_3).await, None);

    // Reopening over all three finds dm_3 empty and brings it up to date.
    let version = dm_1
        .open_volume_group(desc(), vec![DM1, DM2, DM3])
        .await
        .unwrap();
    assert_eq!(version, 2);
    wait_for_rejoin(&dm_1, DM3).await;
    assert_eq!(applied_commit(&dm_3).await, Some(commits));
    for tx in 1..=commits {
        let meta = dm_3
            .catalog()
            .get_blob_desc(VOL, &format!("blob-{}", tx))
            .unwrap();
        assert_eq!(meta.size, u64::from(UNIT));
    }

    let tx = commits + 1;
    client.put(tx, "last", vec![entry(0, UNIT, tx)]).await.unwrap();
    for dm in [&dm_1, &dm_2, &dm_3].iter() {
        assert_eq!(applied_commit(dm).await, Some(tx));
    }
    let q = Client {
        via: &dm_3,
        coord: DM3,
        dmt: DmtVersion(0),
    };
    // dm_3 isn't coordinating; reads go to the coordinator.
    assert_eq!(q.query("last").await, Err(Error::VolNotFound));
    let rsp = client.query("last").await.unwrap();
    assert_eq!(rsp.object_list, vec![entry(0, UNIT, tx)]);
}

pub fn replay_resync_test() {
    setup_tracing_subscriber();
    task::block_on(lagging_replica_rejoins(DmConfig::default(), 3));
}

pub fn full_copy_resync_test() {
    setup_tracing_subscriber();
    let cfg = DmConfig {
        commit_log_retention: 2,
        sync_batch_entries: 2,
        ..DmConfig::default()
    };
    task::block_on(lagging_replica_rejoins(cfg, 4));
}

async fn placement_update(dms: &[&DataManager], dmt: &Dmt) {
    for dm in dms.iter() {
        dm.request(
            dm.self_id,
            Req::NotifyDmtUpdate(CtrlNotifyDmtUpdate { dmt: dmt.clone() }),
        )
        .await
        .unwrap()
        .into_ack()
        .unwrap();
    }
}

async fn placement_commit(dms: &[&DataManager], version: DmtVersion) {
    for dm in dms.iter() {
        dm.request(dm.self_id, Req::DmtCommit(CtrlDmtCommit { version }))
            .await
            .unwrap()
            .into_ack()
            .unwrap();
    }
}

pub fn migration_test() {
    setup_tracing_subscriber();
    task::block_on(async {
        let (dm_1, dm_2, dm_3) = mk_mesh(DmConfig::default()).await;
        let all = [&dm_1, &dm_2, &dm_3];
        let v1 = Dmt::new(DmtVersion(1)).with_column(VOL, vec![DM1]);
        let v2 = Dmt::new(DmtVersion(2)).with_column(VOL, vec![DM3]);

        placement_update(&all, &v1).await;
        placement_commit(&all, DmtVersion(1)).await;
        dm_1.open_volume_group(desc(), vec![DM1]).await.unwrap();

        let old = Client {
            via: &dm_2,
            coord: DM1,
            dmt: DmtVersion(1),
        };
        old.put(1, "a", vec![entry(0, UNIT, 1)]).await.unwrap();

        // dm_1 copies the volume to dm_3 and starts forwarding.
        placement_update(&all, &v2).await;

        old.put(2, "b", vec![entry(0, UNIT, 2)]).await.unwrap();
        let rsp = old.put(3, "a", vec![entry(0, UNIT, 3)]).await.unwrap();
        assert_eq!(rsp.blob_version, 2);

        // Transactions under the new table belong to dm_3.
        let new_at_old = Client {
            via: &dm_2,
            coord: DM1,
            dmt: DmtVersion(2),
        };
        assert_eq!(new_at_old.start(4, "c").await, Err(Error::NotReady));

        placement_commit(&all, DmtVersion(2)).await;
        assert_eq!(applied_commit(&dm_1).await, None);
        assert_eq!(applied_commit(&dm_3).await, Some(3));
        assert!(dm_1.group(VOL).await.is_err());
        assert_eq!(old.start(5, "d").await, Err(Error::VolNotFound));

        dm_3.open_volume_group(desc(), vec![DM3]).await.unwrap();
        let new = Client {
            via: &dm_2,
            coord: DM3,
            dmt: DmtVersion(2),
        };
        let a = new.query("a").await.unwrap();
        assert_eq!(a.blob_version, 2);
        assert_eq!(a.object_list, vec![entry(0, UNIT, 3)]);
        let b = new.query("b").await.unwrap();
        assert_eq!(b.object_list, vec![entry(0, UNIT, 2)]);

        new.put(6, "c", vec![entry(0, UNIT, 6)]).await.unwrap();
        assert_eq!(applied_commit(&dm_3).await, Some(4));
    });
}
