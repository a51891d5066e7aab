use crate::error::{Error, Result};
use crate::peer::connection::PeerHandle;
use crate::peer::ice::CandidatePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// ========== EPOCH ==========

/// Счётчик поколений соединения. Общий для цикла роли и её асинхронных шагов.
#[derive(Clone, Debug, Default)]
pub struct EpochClock(Arc<AtomicU64>);

impl EpochClock {
    pub fn starting_at(epoch: u64) -> Self {
        Self(Arc::new(AtomicU64::new(epoch)))
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Возвращает новое значение; строго больше всех предыдущих
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.current() == epoch
    }

    /// Проверка перед каждым продолжением после точки ожидания
    pub fn ensure(&self, epoch: u64) -> Result<()> {
        let current = self.current();
        if current == epoch {
            Ok(())
        } else {
            Err(Error::Superseded {
                stale: epoch,
                current,
            })
        }
    }
}

/// ========== CONNECTION SLOT ==========

/// Единственное активное соединение роли
pub struct ConnectionSlot {
    handle: Option<Arc<dyn PeerHandle>>,
    clock: EpochClock,
    pub pool: CandidatePool,
    remote_applied: bool,
    remote_in_flight: bool,
}

impl ConnectionSlot {
    pub fn new(clock: EpochClock) -> Self {
        Self {
            handle: None,
            clock,
            pool: CandidatePool::default(),
            remote_applied: false,
            remote_in_flight: false,
        }
    }

    pub fn clock(&self) -> &EpochClock {
        &self.clock
    }

    pub fn epoch(&self) -> u64 {
        self.clock.current()
    }

    pub fn handle(&self) -> Option<Arc<dyn PeerHandle>> {
        self.handle.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.handle.is_none()
    }

    pub fn install(&mut self, handle: Arc<dyn PeerHandle>) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::SlotOccupied(self.epoch()));
        }
        self.handle = Some(handle);
        Ok(())
    }

    /// Забирает соединение и сдвигает эпоху. Пустой слот не трогаем.
    pub fn destroy(&mut self) -> Option<Arc<dyn PeerHandle>> {
        let handle = self.handle.take()?;
        self.clock.advance();
        self.clear_negotiation();
        Some(handle)
    }

    /// Начало нового поколения без активного соединения
    pub fn begin_epoch(&mut self) -> u64 {
        self.clear_negotiation();
        self.clock.advance()
    }

    pub fn remote_applied(&self) -> bool {
        self.remote_applied
    }

    /// Ставит флаг «описание применяется»; `false` если уже в процессе или применено
    pub fn claim_remote(&mut self) -> bool {
        if self.remote_applied || self.remote_in_flight {
            return false;
        }
        self.remote_in_flight = true;
        true
    }

    pub fn mark_remote_applied(&mut self, ok: bool) {
        self.remote_in_flight = false;
        self.remote_applied = ok;
    }

    fn clear_negotiation(&mut self) {
        self.pool.clear();
        self.remote_applied = false;
        self.remote_in_flight = false;
    }
}
