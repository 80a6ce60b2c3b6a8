use crate::counter::Counter;
use crate::explorer::{BscRes, ExplorerClient};
use crate::moralis::{MoralisClient, NftItem};
use eyre::{eyre, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

/// Period of the fallback wake-up; submissions also wake the scheduler
/// immediately through `Notify`.
const SCHED_TICK: Duration = Duration::from_millis(500);

/// Both schedulers front the same third-party quota.
const SCHED_RATE: u32 = 12;
const SCHED_CYCLE: Duration = Duration::from_secs(1);

/// Correlation-id keyed single-use reply mailboxes.
///
/// The waiter owns the receiving half and is responsible for removing the
/// entry when it returns; a delivery that finds no mailbox is dropped.
pub struct Mailboxes<T> {
    inner: Mutex<HashMap<Uuid, oneshot::Sender<Result<T>>>>,
}

impl<T> Mailboxes<T> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, id: Uuid) -> oneshot::Receiver<Result<T>> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().expect("mailbox lock poisoned").insert(id, tx);
        rx
    }

    /// Deliver a result to the waiter, if it is still there.
    fn deliver(&self, id: Uuid, res: Result<T>) -> bool {
        let sender = self.inner.lock().expect("mailbox lock poisoned").remove(&id);
        match sender {
            Some(tx) => tx.send(res).is_ok(),
            None => false,
        }
    }

    fn remove(&self, id: Uuid) {
        self.inner.lock().expect("mailbox lock poisoned").remove(&id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().expect("mailbox lock poisoned").len()
    }
}

/// Handle returned by `submit`; resolves to the call result or a timeout.
pub struct PendingCall<T> {
    id: Uuid,
    rx: oneshot::Receiver<Result<T>>,
    mailboxes: Arc<Mailboxes<T>>,
}

impl<T> PendingCall<T> {
    /// Block until the scheduler delivers, or `deadline` elapses. The mailbox
    /// is removed on every exit path, so a late delivery is dropped.
    pub async fn wait(self, deadline: Duration) -> Result<T> {
        let res = tokio::time::timeout(deadline, self.rx).await;
        self.mailboxes.remove(self.id);
        match res {
            Ok(Ok(inner)) => inner,
            Ok(Err(_)) => Err(eyre!("scheduler dropped the call")),
            Err(_) => Err(eyre!("query timeout")),
        }
    }
}

struct TxRecordReq {
    id: Uuid,
    contract_addr: Option<String>,
    wallet_addr: String,
    block_num: u64,
}

impl TxRecordReq {
    /// A native lookup is two REST calls (txlist + txlistinternal), so it
    /// charges double against the window.
    fn weight(&self) -> u32 {
        if self.contract_addr.is_none() {
            2
        } else {
            1
        }
    }
}

/// Rate-limited front for explorer tx-record lookups.
pub struct TxRecordScheduler {
    counter: Counter,
    queue: Mutex<Vec<TxRecordReq>>,
    mailboxes: Arc<Mailboxes<BscRes>>,
    notify: Notify,
    explorer: ExplorerClient,
}

impl TxRecordScheduler {
    pub fn start(explorer: ExplorerClient) -> Arc<Self> {
        let sched = Arc::new(Self {
            counter: Counter::new(SCHED_RATE, SCHED_CYCLE),
            queue: Mutex::new(Vec::new()),
            mailboxes: Arc::new(Mailboxes::new()),
            notify: Notify::new(),
            explorer,
        });
        tokio::spawn(sched.clone().run());
        sched
    }

    /// Enqueue a lookup; `contract_addr = None` selects the native record
    /// pair, `Some` the token-transfer endpoint.
    pub fn query_tx_record(
        &self,
        contract_addr: Option<String>,
        wallet_addr: String,
        block_num: u64,
    ) -> PendingCall<BscRes> {
        let id = Uuid::new_v4();
        let rx = self.mailboxes.register(id);
        self.queue.lock().expect("queue lock poisoned").push(TxRecordReq {
            id,
            contract_addr,
            wallet_addr,
            block_num,
        });
        self.notify.notify_one();
        PendingCall {
            id,
            rx,
            mailboxes: self.mailboxes.clone(),
        }
    }

    async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(SCHED_TICK);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.notify.notified() => {}
            }
            self.handle();
        }
    }

    /// One admission pass over the queue.
    ///
    /// Walked in reverse so `swap_remove` only ever moves an already-visited
    /// element into the hole. Fairness is approximate FIFO and is violated
    /// under pressure.
    fn handle(&self) {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        let mut i = queue.len();
        while i > 0 {
            i -= 1;
            if !self.counter.allow(queue[i].weight()) {
                continue;
            }
            let req = queue.swap_remove(i);
            let explorer = self.explorer.clone();
            let mailboxes = self.mailboxes.clone();
            tokio::spawn(async move {
                let res = match &req.contract_addr {
                    None => {
                        explorer
                            .query_native_tx_record(&req.wallet_addr, req.block_num)
                            .await
                    }
                    Some(contract) => {
                        explorer
                            .query_erc20_tx_record(contract, &req.wallet_addr, req.block_num)
                            .await
                    }
                };
                if !mailboxes.deliver(req.id, res) {
                    tracing::debug!(id = %req.id, "waiter gone; dropping tx record result");
                }
            });
        }
    }
}

struct NftListReq {
    id: Uuid,
    wallet_addr: String,
    network: String,
}

/// Rate-limited front for Moralis NFT-list lookups.
pub struct NftListScheduler {
    counter: Counter,
    queue: Mutex<Vec<NftListReq>>,
    mailboxes: Arc<Mailboxes<Vec<NftItem>>>,
    notify: Notify,
    moralis: MoralisClient,
}

impl NftListScheduler {
    pub fn start(moralis: MoralisClient) -> Arc<Self> {
        let sched = Arc::new(Self {
            counter: Counter::new(SCHED_RATE, SCHED_CYCLE),
            queue: Mutex::new(Vec::new()),
            mailboxes: Arc::new(Mailboxes::new()),
            notify: Notify::new(),
            moralis,
        });
        tokio::spawn(sched.clone().run());
        sched
    }

    pub fn query_nft_list(&self, wallet_addr: String, network: String) -> PendingCall<Vec<NftItem>> {
        let id = Uuid::new_v4();
        let rx = self.mailboxes.register(id);
        self.queue.lock().expect("queue lock poisoned").push(NftListReq {
            id,
            wallet_addr,
            network,
        });
        self.notify.notify_one();
        PendingCall {
            id,
            rx,
            mailboxes: self.mailboxes.clone(),
        }
    }

    async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(SCHED_TICK);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.notify.notified() => {}
            }
            self.handle();
        }
    }

    fn handle(&self) {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        let mut i = queue.len();
        while i > 0 {
            i -= 1;
            if !self.counter.allow(1) {
                continue;
            }
            let req = queue.swap_remove(i);
            let moralis = self.moralis.clone();
            let mailboxes = self.mailboxes.clone();
            tokio::spawn(async move {
                let res = moralis.query_wallet_nft(&req.wallet_addr, &req.network).await;
                if !mailboxes.deliver(req.id, res) {
                    tracing::debug!(id = %req.id, "waiter gone; dropping nft list result");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivered_result_reaches_the_waiter() {
        let mailboxes = Arc::new(Mailboxes::<u64>::new());
        let id = Uuid::new_v4();
        let rx = mailboxes.register(id);
        let call = PendingCall {
            id,
            rx,
            mailboxes: mailboxes.clone(),
        };
        assert!(mailboxes.deliver(id, Ok(7)));
        let got = call.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, 7);
        assert_eq!(mailboxes.len(), 0);
    }

    #[tokio::test]
    async fn wait_times_out_and_cleans_up() {
        let mailboxes = Arc::new(Mailboxes::<u64>::new());
        let id = Uuid::new_v4();
        let rx = mailboxes.register(id);
        let call = PendingCall {
            id,
            rx,
            mailboxes: mailboxes.clone(),
        };
        let err = call.wait(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err.to_string(), "query timeout");
        assert_eq!(mailboxes.len(), 0);
        // a late delivery finds no mailbox and is dropped
        assert!(!mailboxes.deliver(id, Ok(1)));
    }

    #[tokio::test]
    async fn error_results_are_surfaced_not_retried() {
        let mailboxes = Arc::new(Mailboxes::<u64>::new());
        let id = Uuid::new_v4();
        let rx = mailboxes.register(id);
        let call = PendingCall {
            id,
            rx,
            mailboxes: mailboxes.clone(),
        };
        mailboxes.deliver(id, Err(eyre!("boom")));
        let err = call.wait(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn native_lookups_cost_double() {
        let native = TxRecordReq {
            id: Uuid::new_v4(),
            contract_addr: None,
            wallet_addr: "0x1".into(),
            block_num: 1,
        };
        let erc20 = TxRecordReq {
            id: Uuid::new_v4(),
            contract_addr: Some("0x2".into()),
            wallet_addr: "0x1".into(),
            block_num: 1,
        };
        assert_eq!(native.weight(), 2);
        assert_eq!(erc20.weight(), 1);
    }
}
