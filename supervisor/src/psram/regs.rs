// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! QSPI memory interface register layouts.

mycelium_bitfield::bitfield! {
    /// Direct-mode control and status.
    #[derive(PartialEq, Eq)]
    pub struct DirectCsr<u32> {
        /// Enable direct mode.
        pub const EN: bool;
        /// A direct-mode transfer is in progress, or an XIP transfer is cooling down.
        pub const BUSY: bool;
        pub const ASSERT_CS0N: bool;
        /// Hold the second chip select asserted.
        pub const ASSERT_CS1N: bool;
        const _RESERVED0 = 2;
        pub const AUTO_CS0N: bool;
        pub const AUTO_CS1N: bool;
        const _RESERVED1 = 2;
        pub const TXFULL: bool;
        pub const TXEMPTY: bool;
        pub const TXLEVEL = 3;
        const _RESERVED2 = 1;
        pub const RXEMPTY: bool;
        pub const RXFULL: bool;
        pub const RXLEVEL = 3;
        const _RESERVED3 = 1;
        /// Serial clock divider for direct-mode transfers.
        pub const CLKDIV = 8;
        pub const RXDELAY = 2;
    }
}

mycelium_bitfield::bitfield! {
    /// Direct-mode transmit FIFO entry.
    #[derive(PartialEq, Eq)]
    pub struct DirectTx<u32> {
        pub const DATA = 16;
        pub const IWIDTH: Width;
        /// Transfer 16 bits instead of 8.
        pub const DWIDTH: bool;
        /// Drive the data lines (required for quad transmit).
        pub const OE: bool;
        /// Do not push the received data into the RX FIFO.
        pub const NOPUSH: bool;
    }
}

mycelium_bitfield::bitfield! {
    /// Timing of memory-mapped accesses through a chip select.
    #[derive(PartialEq, Eq)]
    pub struct Timing<u32> {
        pub const CLKDIV = 8;
        pub const RXDELAY = 3;
        const _RESERVED0 = 1;
        /// Minimum deselect time, in system clock cycles.
        pub const MIN_DESELECT = 5;
        /// Maximum select time, in units of 64 system clock cycles.
        pub const MAX_SELECT = 6;
        /// Extra system cycles to hold the chip select after the last clock edge.
        pub const SELECT_HOLD = 2;
        pub const SELECT_SETUP = 1;
        const _RESERVED1 = 2;
        pub const PAGEBREAK: PageBreak;
        pub const COOLDOWN = 2;
    }
}

mycelium_bitfield::bitfield! {
    /// Shape of a memory-mapped read or write transfer.
    #[derive(PartialEq, Eq)]
    pub struct Format<u32> {
        pub const PREFIX_WIDTH: Width;
        pub const ADDR_WIDTH: Width;
        pub const SUFFIX_WIDTH: Width;
        pub const DUMMY_WIDTH: Width;
        pub const DATA_WIDTH: Width;
        const _RESERVED0 = 2;
        /// Send an 8-bit command prefix.
        pub const PREFIX_LEN: bool;
        const _RESERVED1 = 1;
        pub const SUFFIX_LEN = 2;
        /// Dummy cycles in units of 4 bits.
        pub const DUMMY_LEN = 3;
        const _RESERVED2 = 9;
        pub const DTR: bool;
    }
}

mycelium_bitfield::bitfield! {
    /// Command prefix and suffix of a memory-mapped transfer.
    #[derive(PartialEq, Eq)]
    pub struct Command<u32> {
        pub const PREFIX = 8;
        pub const SUFFIX = 8;
    }
}

mycelium_bitfield::enum_from_bits! {
    /// Number of data lines used for a transfer phase.
    #[derive(Debug, Eq, PartialEq)]
    pub enum Width<u8> {
        Single = 0b00,
        Dual = 0b01,
        Quad = 0b10,
    }
}

mycelium_bitfield::enum_from_bits! {
    /// Page boundary at which a burst is split.
    #[derive(Debug, Eq, PartialEq)]
    pub enum PageBreak<u8> {
        None = 0b00,
        B256 = 0b01,
        B1024 = 0b10,
        B4096 = 0b11,
    }
}

/// `DUMMY_LEN` encoding of 24 dummy bits.
pub const DUMMY_LEN_24: u32 = 6;
