pub mod market_calendar;
