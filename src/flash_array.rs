//! Internal-flash backing for [`KeyedBlobStore`](crate::credential_store::KeyedBlobStore).
//!
//! Flash is treated as an array of erase blocks counted from the end of memory backwards, so
//! block 0 is the last sector of the chip. Reserve blocks once at startup and hand each
//! [`FlashBlock`] to the subsystem that owns it.
//!
//! ⚠️ **Warning**: The RP2040 stores firmware, vector tables, and user data in the same flash
//! device. Only reserve as many blocks as the linker script leaves free at the end of flash.

use core::array;
use core::cell::RefCell;

use embassy_rp::Peri;
use embassy_rp::flash::{Blocking, ERASE_SIZE, Flash as EmbassyFlash};
use embassy_rp::peripherals::FLASH;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use portable_atomic::{AtomicU32, Ordering};
use static_cell::StaticCell;

use crate::credential_store::{BLOCK_SIZE, BlockStorage};
use crate::{Error, Result};

// Internal flash size for Raspberry Pi Pico 1 W (2 MB).
const INTERNAL_FLASH_SIZE: usize = 2 * 1024 * 1024;
const TOTAL_BLOCKS: u32 = (INTERNAL_FLASH_SIZE / ERASE_SIZE) as u32;

const _: () = assert!(BLOCK_SIZE == ERASE_SIZE);

type InternalFlash = EmbassyFlash<'static, FLASH, Blocking, INTERNAL_FLASH_SIZE>;

/// Shared flash manager that owns the hardware driver and allocation cursor.
struct FlashManager {
    flash: Mutex<CriticalSectionRawMutex, RefCell<InternalFlash>>,
    next_block: AtomicU32,
}

impl FlashManager {
    fn new(peripheral: Peri<'static, FLASH>) -> Self {
        Self {
            flash: Mutex::new(RefCell::new(EmbassyFlash::new_blocking(peripheral))),
            next_block: AtomicU32::new(0),
        }
    }

    fn with_flash<R>(&self, operation: impl FnOnce(&mut InternalFlash) -> Result<R>) -> Result<R> {
        self.flash.lock(|flash| operation(&mut flash.borrow_mut()))
    }

    fn reserve<const N: usize>(&'static self) -> Result<[FlashBlock; N]> {
        let count = u32::try_from(N).map_err(|_| Error::Storage)?;
        let start = self.next_block.fetch_add(count, Ordering::SeqCst);
        let end = start.checked_add(count).ok_or(Error::Storage)?;
        if end > TOTAL_BLOCKS {
            // rollback
            self.next_block.fetch_sub(count, Ordering::SeqCst);
            return Err(Error::Storage);
        }
        Ok(array::from_fn(|index| FlashBlock {
            manager: self,
            block: start.saturating_add(u32::try_from(index).unwrap_or(u32::MAX)),
        }))
    }
}

/// Handle to a single flash erase block.
pub struct FlashBlock {
    manager: &'static FlashManager,
    block: u32,
}

impl FlashBlock {
    /// Byte offset of this block within flash.
    const fn offset(&self) -> u32 {
        // `reserve` keeps `block` below TOTAL_BLOCKS.
        let capacity = INTERNAL_FLASH_SIZE as u32;
        capacity.saturating_sub(self.block.saturating_add(1).saturating_mul(ERASE_SIZE as u32))
    }
}

impl BlockStorage for FlashBlock {
    fn read_block(&mut self, block: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        let offset = self.offset();
        self.manager
            .with_flash(|flash| flash.blocking_read(offset, block).map_err(Error::Flash))
    }

    fn write_block(&mut self, block: &[u8; BLOCK_SIZE]) -> Result<()> {
        let offset = self.offset();
        self.manager.with_flash(|flash| {
            flash
                .blocking_erase(offset, offset.saturating_add(ERASE_SIZE as u32))
                .map_err(Error::Flash)?;
            flash.blocking_write(offset, block).map_err(Error::Flash)
        })?;
        debug!("Flash: wrote block {}", self.block);
        Ok(())
    }
}

/// Static resources for [`FlashArray`].
pub struct FlashArrayStatic {
    manager_cell: StaticCell<FlashManager>,
    manager_ref: Mutex<CriticalSectionRawMutex, RefCell<Option<&'static FlashManager>>>,
}

impl FlashArrayStatic {
    fn manager(&'static self, peripheral: Peri<'static, FLASH>) -> &'static FlashManager {
        self.manager_ref.lock(|slot_cell| {
            let mut slot = slot_cell.borrow_mut();
            *slot.get_or_insert_with(|| {
                let manager: &'static FlashManager =
                    self.manager_cell.init(FlashManager::new(peripheral));
                manager
            })
        })
    }
}

/// Marker type used as a namespace for reserving `N` flash blocks.
///
/// ```no_run
/// # #![no_std]
/// # #![no_main]
/// # use panic_probe as _;
/// use wifi_onboard::credential_store::KeyedBlobStore;
/// use wifi_onboard::flash_array::{FlashArray, FlashArrayStatic};
///
/// async fn example(p: embassy_rp::Peripherals) -> wifi_onboard::Result<()> {
///     static FLASH_STATIC: FlashArrayStatic = FlashArray::<1>::new_static();
///     let [credential_block] = FlashArray::new(&FLASH_STATIC, p.FLASH)?;
///     let store = KeyedBlobStore::new(credential_block);
///     # let _ = store;
///     Ok(())
/// }
/// ```
pub struct FlashArray<const N: usize>;

impl<const N: usize> FlashArray<N> {
    /// Get static resources for creating flash arrays.
    #[must_use]
    pub const fn new_static() -> FlashArrayStatic {
        FlashArrayStatic {
            manager_cell: StaticCell::new(),
            manager_ref: Mutex::new(RefCell::new(None)),
        }
    }

    /// Reserve the next `N` blocks (block 0 first) as an array you can destructure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when flash has no `N` unreserved blocks left.
    pub fn new(
        flash_static: &'static FlashArrayStatic,
        peripheral: Peri<'static, FLASH>,
    ) -> Result<[FlashBlock; N]> {
        flash_static.manager(peripheral).reserve::<N>()
    }
}
